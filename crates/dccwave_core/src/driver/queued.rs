//! Compilation of bitstreams into DMA control-block programs.

use std::collections::HashMap;

use crate::bitstream::{Bitstream, BitstreamEvent};
use crate::compiler_log;
use crate::driver::control_block::{
    DmaControlBlock, Peripheral, TransferInformation, CONTROL_BLOCK_BYTES, CONTROL_BLOCK_WORDS,
};
use crate::driver::DriverOptions;
use crate::hardware::{
    AllocationError, BusAddress, Hardware, UncachedMemory, GPIO_OFFSET, GPIO_OUTPUT_SET_OFFSET,
    PWM_CHANNEL_1_RANGE_OFFSET, PWM_FIFO_OFFSET, PWM_OFFSET,
};

/// Data words between the DMA engine writing a word into the PWM FIFO and the
/// serialiser emitting it. GPIO writes are postponed by this many words so
/// they land next to the word they belong to.
pub const EVENT_DELAY: u32 = 2;

/// The parsed bitstream would transmit nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("bitstream contains no data")]
    ContainsNoData,
}

/// A GPIO transition requested by a bitstream marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, enum_iterator::Sequence)]
pub enum GpioEvent {
    RailComCutoutStart,
    RailComCutoutEnd,
    DebugStart,
    DebugEnd,
}

/// Pending GPIO transitions with the data words left until each is due.
type DelayedEvents = Vec<(GpioEvent, u32)>;

/// A point in the compiled program where transmission may leave the stream:
/// rewriting the recorded block's next pointer redirects the engine once it
/// passes that block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    control_block_offset: usize,
    range: u32,
    delayed_events: DelayedEvents,
}

impl Breakpoint {
    /// Index of the control block whose next pointer leaves the stream.
    pub fn control_block_offset(&self) -> usize {
        self.control_block_offset
    }
}

/// Per-index snapshot of the unrolling state, used to recognise when the
/// program has wound back onto itself.
#[derive(Debug, Clone)]
struct IndexState {
    delayed_events: DelayedEvents,
    range: u32,
    /// Block compiled for this index under the snapshot above, once flushed.
    control_block: Option<usize>,
}

/// Mutable state threaded through one unrolling run.
#[derive(Debug)]
struct ParseState {
    range: u32,
    delayed_events: DelayedEvents,
    pending_words: Vec<u32>,
    pending_index: usize,
    /// Breakpoint transfers must also reproduce the range register.
    require_range_match: bool,
}

/// A bitstream compiled to control blocks plus their shared data buffer,
/// ready to be committed to uncached memory and handed to the DMA engine.
///
/// The first data slot is the flag word: the start block writes `1` to it,
/// the end block `-1`, which is how transmission and repetition are observed.
pub struct QueuedBitstream {
    peripheral_bus_base: BusAddress,
    railcom_gpio: usize,
    debug_gpio: usize,
    control_blocks: Vec<DmaControlBlock>,
    data: Vec<u32>,
    breakpoints: Vec<Breakpoint>,
    memo: HashMap<usize, IndexState>,
    duration_us: f32,
    memory: Option<Box<dyn UncachedMemory>>,
}

impl QueuedBitstream {
    pub fn new(peripheral_bus_base: BusAddress, options: &DriverOptions) -> Self {
        QueuedBitstream {
            peripheral_bus_base,
            railcom_gpio: options.railcom_gpio,
            debug_gpio: options.debug_gpio,
            control_blocks: Vec::new(),
            data: Vec::new(),
            breakpoints: Vec::new(),
            memo: HashMap::new(),
            duration_us: 0.0,
            memory: None,
        }
    }

    /// Compile `bitstream` into this program, unrolling its repeating section
    /// until the loop closes on itself.
    pub fn parse(&mut self, bitstream: &Bitstream) -> Result<(), ParseError> {
        assert!(self.memory.is_none(), "bitstream already committed");

        if self.data.is_empty() {
            // Reserve the flag word.
            self.data.push(0);
        }
        self.memo.clear();
        self.duration_us = self.duration_us.max(bitstream.duration_us());

        let start = self.push_start_block();
        let initial = ParseState {
            range: 0,
            delayed_events: Vec::new(),
            pending_words: Vec::new(),
            pending_index: 0,
            require_range_match: false,
        };
        self.unroll(bitstream, initial, start)
    }

    /// Compile an alternate entry chain for transmissions arriving from
    /// `breakpoint` of a predecessor: the chain unrolls until the range and
    /// pending GPIO state agree with an already-compiled point of this
    /// program, then joins it. Returns the entry control block.
    ///
    /// Must be given the same bitstream the preceding [`parse`] call was.
    pub fn transfer_from(
        &mut self,
        bitstream: &Bitstream,
        breakpoint: &Breakpoint,
    ) -> Result<usize, ParseError> {
        assert!(self.memory.is_none(), "bitstream already committed");

        let start = self.push_start_block();
        let initial = ParseState {
            range: breakpoint.range,
            delayed_events: breakpoint.delayed_events.clone(),
            pending_words: Vec::new(),
            pending_index: 0,
            require_range_match: true,
        };
        self.unroll(bitstream, initial, start)?;

        Ok(start)
    }

    /// The unrolling loop shared by [`parse`] and [`transfer_from`].
    fn unroll(
        &mut self,
        bitstream: &Bitstream,
        mut state: ParseState,
        start_block: usize,
    ) -> Result<(), ParseError> {
        let events = bitstream.events();
        let first_block = self.control_blocks.len();
        let mut restart_from = 0;

        let loop_target = 'unroll: loop {
            let mut data_seen = false;
            let mut index = restart_from;

            while index < events.len() {
                match events[index] {
                    BitstreamEvent::Data { word, size } => {
                        data_seen = true;

                        // Wound back onto a previously seen state?
                        let revisited = self.memo.get(&index).and_then(|memoized| {
                            let matches = memoized.delayed_events == state.delayed_events
                                && (!state.require_range_match || memoized.range == state.range);
                            matches.then(|| memoized.control_block)
                        });
                        if let Some(control_block) = revisited {
                            if let Some(block) = control_block {
                                if !state.pending_words.is_empty() {
                                    self.flush_pending(&mut state);
                                }
                                break 'unroll block;
                            } else if state.pending_index == index
                                && !state.pending_words.is_empty()
                            {
                                // The pending run began here with this exact
                                // state; its block closes the loop.
                                break 'unroll self.flush_pending(&mut state);
                            }
                        }

                        if state.pending_words.is_empty() {
                            state.pending_index = index;
                            self.memo.insert(
                                index,
                                IndexState {
                                    delayed_events: state.delayed_events.clone(),
                                    range: state.range,
                                    control_block: None,
                                },
                            );
                        }

                        state.pending_words.push(word);

                        for (_, delay) in &mut state.delayed_events {
                            *delay -= 1;
                        }
                        let due: Vec<GpioEvent> = state
                            .delayed_events
                            .iter()
                            .filter(|(_, delay)| *delay == 0)
                            .map(|(event, _)| *event)
                            .collect();
                        state.delayed_events.retain(|(_, delay)| *delay > 0);

                        // Keep collecting words while nothing interrupts the run.
                        if size == state.range && due.is_empty() {
                            index += 1;
                            continue;
                        }

                        self.flush_pending(&mut state);
                        if size != state.range {
                            self.push_range_block(size);
                            state.range = size;
                        }
                        if !due.is_empty() {
                            self.push_gpio_block(&due);
                        }
                    }
                    BitstreamEvent::RailComCutoutStart => {
                        state.delayed_events.push((GpioEvent::RailComCutoutStart, EVENT_DELAY));
                    }
                    BitstreamEvent::RailComCutoutEnd => {
                        state.delayed_events.push((GpioEvent::RailComCutoutEnd, EVENT_DELAY));
                    }
                    BitstreamEvent::DebugStart => {
                        state.delayed_events.push((GpioEvent::DebugStart, EVENT_DELAY));
                    }
                    BitstreamEvent::DebugEnd => {
                        state.delayed_events.push((GpioEvent::DebugEnd, EVENT_DELAY));
                    }
                    BitstreamEvent::LoopStart => {
                        restart_from = index + 1;
                        if !state.pending_words.is_empty() {
                            self.flush_pending(&mut state);
                        }
                    }
                    BitstreamEvent::Breakpoint => {
                        if !state.pending_words.is_empty() {
                            self.flush_pending(&mut state);
                        }
                        self.breakpoints.push(Breakpoint {
                            control_block_offset: self.control_blocks.len() - 1,
                            range: state.range,
                            delayed_events: state.delayed_events.clone(),
                        });
                    }
                }

                index += 1;
            }

            if !data_seen {
                return Err(ParseError::ContainsNoData);
            }
            compiler_log!(
                "pass complete without closing the loop; unrolling again from {}",
                restart_from
            );
        };

        if loop_target >= first_block {
            // The loop closed on a block of this very chain: terminate it
            // with an end block winding back to the target.
            let end = self.push_end_block(loop_target);
            self.breakpoints.push(Breakpoint {
                control_block_offset: end,
                range: state.range,
                delayed_events: state.delayed_events.clone(),
            });
        } else if self.control_blocks.len() > first_block {
            // Joined an earlier chain after some unrolled prologue.
            let last = self.control_blocks.len() - 1;
            self.control_blocks[last].next_control_block_address =
                loop_target as u32 * CONTROL_BLOCK_BYTES;
        }

        let entry = if self.control_blocks.len() > first_block {
            first_block
        } else {
            loop_target
        };
        self.control_blocks[start_block].next_control_block_address =
            entry as u32 * CONTROL_BLOCK_BYTES;

        compiler_log!(
            "compiled {} control blocks, {} data words, {} breakpoints",
            self.control_blocks.len(),
            self.data.len(),
            self.breakpoints.len()
        );

        Ok(())
    }

    /// Append a word to the data buffer, returning its byte offset.
    fn push_data_word(&mut self, value: u32) -> u32 {
        self.data.push(value);
        (self.data.len() as u32 - 1) * 4
    }

    fn push_block(&mut self, mut block: DmaControlBlock) -> usize {
        let index = self.control_blocks.len();
        block.next_control_block_address = (index as u32 + 1) * CONTROL_BLOCK_BYTES;
        self.control_blocks.push(block);
        index
    }

    /// Start block: writes `1` to the flag word. Its next pointer is patched
    /// once the entry of the chain is known.
    fn push_start_block(&mut self) -> usize {
        let source = self.push_data_word(1);
        self.push_block(DmaControlBlock::new(
            TransferInformation::WAIT_FOR_WRITE_RESPONSE,
            source,
            0,
            4,
            0,
            0,
        ))
    }

    /// End block: writes `-1` to the flag word and winds back to `target`.
    fn push_end_block(&mut self, target: usize) -> usize {
        let source = self.push_data_word(-1i32 as u32);
        let end = self.push_block(DmaControlBlock::new(
            TransferInformation::WAIT_FOR_WRITE_RESPONSE,
            source,
            0,
            4,
            0,
            0,
        ));
        self.control_blocks[end].next_control_block_address =
            target as u32 * CONTROL_BLOCK_BYTES;
        end
    }

    /// Flush the pending word run as one FIFO transfer block.
    fn flush_pending(&mut self, state: &mut ParseState) -> usize {
        debug_assert!(!state.pending_words.is_empty());

        let source = (self.data.len() as u32) * 4;
        let length = (state.pending_words.len() as u32) * 4;
        self.data.append(&mut state.pending_words);

        let block = self.push_block(DmaControlBlock::new(
            TransferInformation::WAIT_FOR_WRITE_RESPONSE
                | TransferInformation::SRC_ADDRESS_INCREMENT
                | TransferInformation::DEST_DREQ
                | TransferInformation::peripheral_mapping(Peripheral::Pwm),
            source,
            self.peripheral_bus_base + PWM_OFFSET + PWM_FIFO_OFFSET,
            length,
            0,
            0,
        ));

        if let Some(memoized) = self.memo.get_mut(&state.pending_index) {
            memoized.control_block = Some(block);
        }

        block
    }

    /// One-word transfer updating the PWM range register.
    fn push_range_block(&mut self, range: u32) -> usize {
        let source = self.push_data_word(range);
        self.push_block(DmaControlBlock::new(
            TransferInformation::WAIT_FOR_WRITE_RESPONSE
                | TransferInformation::DEST_DREQ
                | TransferInformation::peripheral_mapping(Peripheral::Pwm),
            source,
            self.peripheral_bus_base + PWM_OFFSET + PWM_CHANNEL_1_RANGE_OFFSET,
            4,
            0,
            0,
        ))
    }

    /// Two-dimensional transfer hitting the GPIO set and clear banks with a
    /// single block. When one block carries two transitions of the same pin,
    /// the later one wins.
    fn push_gpio_block(&mut self, due: &[GpioEvent]) -> usize {
        let mut set = [0u32; 2];
        let mut clear = [0u32; 2];
        for event in due {
            let (pin, level) = match event {
                GpioEvent::RailComCutoutStart => (self.railcom_gpio, false),
                GpioEvent::RailComCutoutEnd => (self.railcom_gpio, true),
                GpioEvent::DebugStart => (self.debug_gpio, true),
                GpioEvent::DebugEnd => (self.debug_gpio, false),
            };

            let bank = pin / 32;
            let bit = 1u32 << (pin % 32);
            if level {
                set[bank] |= bit;
                clear[bank] &= !bit;
            } else {
                clear[bank] |= bit;
                set[bank] &= !bit;
            }
        }

        let source = (self.data.len() as u32) * 4;
        self.data.extend([set[0], set[1], clear[0], clear[1]]);

        self.push_block(DmaControlBlock::new(
            TransferInformation::WAIT_FOR_WRITE_RESPONSE
                | TransferInformation::TD_MODE
                | TransferInformation::SRC_ADDRESS_INCREMENT
                | TransferInformation::DEST_ADDRESS_INCREMENT,
            source,
            self.peripheral_bus_base + GPIO_OFFSET + GPIO_OUTPUT_SET_OFFSET,
            DmaControlBlock::transfer_length_2d(8, 2),
            DmaControlBlock::stride_2d(0, 4),
            0,
        ))
    }

    /// Fix the program into uncached memory: every offset becomes a bus
    /// address and the blocks and data are copied out.
    ///
    /// May be called once per bitstream; committing twice is a programming
    /// error.
    pub fn commit(&mut self, hardware: &impl Hardware) -> Result<(), AllocationError> {
        assert!(self.memory.is_none(), "bitstream committed twice");

        let control_bytes = self.control_blocks.len() as u32 * CONTROL_BLOCK_BYTES;
        let total = control_bytes as usize + self.data.len() * 4;
        let memory = hardware.allocate_uncached(total)?;
        let bus_address = memory.bus_address();

        for (index, block) in self.control_blocks.iter_mut().enumerate() {
            if block.source_address < self.peripheral_bus_base {
                block.source_address += bus_address + control_bytes;
            }
            if block.destination_address < self.peripheral_bus_base {
                block.destination_address += bus_address + control_bytes;
            }
            block.next_control_block_address += bus_address;

            memory.write_words(index * CONTROL_BLOCK_WORDS, &block.words());
        }
        memory.write_words(control_bytes as usize / 4, &self.data);

        self.memory = Some(Box::new(memory));
        Ok(())
    }

    fn committed(&self) -> &dyn UncachedMemory {
        self.memory.as_deref().expect("bitstream not committed")
    }

    /// Bus address of the program's primary entry point.
    pub fn bus_address(&self) -> BusAddress {
        self.committed().bus_address()
    }

    /// Bus address of an individual control block.
    pub fn control_block_bus_address(&self, index: usize) -> BusAddress {
        self.committed().bus_address() + index as u32 * CONTROL_BLOCK_BYTES
    }

    /// Redirect a committed control block's next pointer, linking a
    /// successor program in behind the engine's back.
    pub fn set_next(&self, control_block: usize, address: BusAddress) {
        self.committed()
            .write_word(control_block * CONTROL_BLOCK_WORDS + 5, address);
    }

    fn flag(&self) -> i32 {
        self.committed()
            .read_word(self.control_blocks.len() * CONTROL_BLOCK_WORDS) as i32
    }

    /// The engine has reached this program's start block.
    pub fn is_transmitting(&self) -> bool {
        self.flag() != 0
    }

    /// The engine has passed this program's end block at least once.
    pub fn is_repeating(&self) -> bool {
        self.flag() < 0
    }

    pub fn is_committed(&self) -> bool {
        self.memory.is_some()
    }

    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    /// One full playback of the parsed bitstream, in microseconds.
    pub fn duration_us(&self) -> f32 {
        self.duration_us
    }

    #[cfg(any(test, feature = "debug-functionality"))]
    pub fn control_blocks(&self) -> &[DmaControlBlock] {
        &self.control_blocks
    }

    #[cfg(any(test, feature = "debug-functionality"))]
    pub fn data(&self) -> &[u32] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::{GpioEvent, ParseError, QueuedBitstream, EVENT_DELAY};
    use crate::bitstream::Bitstream;
    use crate::driver::control_block::{
        DmaControlBlock, Peripheral, TransferInformation, CONTROL_BLOCK_BYTES,
    };
    use crate::driver::DriverOptions;
    use crate::hardware::sim::SimHardware;
    use crate::hardware::{Hardware, GPIO_OFFSET, GPIO_OUTPUT_SET_OFFSET, PERIPHERAL_BUS_BASE};
    use crate::timing::SignalTiming;

    fn bitstream() -> Bitstream {
        Bitstream::new(SignalTiming::new(14.5).unwrap())
    }

    fn compiled(bitstream: &Bitstream) -> QueuedBitstream {
        let mut queued = QueuedBitstream::new(PERIPHERAL_BUS_BASE, &DriverOptions::default());
        queued.parse(bitstream).unwrap();
        queued
    }

    fn is_fifo_block(block: &DmaControlBlock) -> bool {
        block.destination_address & 0xFFFF == 0xC018
    }

    fn is_range_block(block: &DmaControlBlock) -> bool {
        block.destination_address & 0xFFFF == 0xC010
    }

    fn is_gpio_block(block: &DmaControlBlock) -> bool {
        block.destination_address == PERIPHERAL_BUS_BASE + GPIO_OFFSET + GPIO_OUTPUT_SET_OFFSET
    }

    /// Blocks writing the flag word (start and end).
    fn is_flag_block(block: &DmaControlBlock) -> bool {
        block.destination_address == 0
    }

    #[test]
    fn test_single_word_program() {
        let mut stream = bitstream();
        stream.append_bits(0xDEAD_BEEF, 32);
        let queued = compiled(&stream);

        let blocks = queued.control_blocks();
        assert_eq!(blocks.len(), 4);

        // Start writes 1 to the flag word.
        assert!(is_flag_block(&blocks[0]));
        assert_eq!(queued.data()[0], 0);
        assert_eq!(queued.data()[(blocks[0].source_address / 4) as usize], 1);

        // One data word to the FIFO.
        assert!(is_fifo_block(&blocks[1]));
        assert_eq!(blocks[1].transfer_length, 4);
        assert_eq!(queued.data()[(blocks[1].source_address / 4) as usize], 0xDEAD_BEEF);
        assert_eq!(
            blocks[1].transfer_information.peripheral(),
            Some(Peripheral::Pwm)
        );

        // Range follows the data it applies to.
        assert!(is_range_block(&blocks[2]));
        assert_eq!(queued.data()[(blocks[2].source_address / 4) as usize], 32);

        // End writes -1 and winds back to the data block, skipping the range
        // write on subsequent passes.
        assert!(is_flag_block(&blocks[3]));
        assert_eq!(
            queued.data()[(blocks[3].source_address / 4) as usize] as i32,
            -1
        );
        assert_eq!(
            blocks[3].next_control_block_address,
            CONTROL_BLOCK_BYTES
        );
    }

    #[test]
    fn test_marker_program() {
        let mut stream = bitstream();
        stream.append_bits(0x0000_0001, 32);
        stream.mark_debug_start();
        stream.append_bits(0x0000_0002, 32);
        stream.append_bits(0x0000_0003, 32);
        let queued = compiled(&stream);

        let blocks = queued.control_blocks();
        assert_eq!(blocks.len(), 6);

        assert!(is_flag_block(&blocks[0]));
        assert!(is_fifo_block(&blocks[1]));
        assert_eq!(blocks[1].transfer_length, 4);
        assert!(is_range_block(&blocks[2]));
        assert!(is_fifo_block(&blocks[3]));
        assert_eq!(blocks[3].transfer_length, 8);
        assert!(is_gpio_block(&blocks[4]));
        assert!(is_flag_block(&blocks[5]));

        // The debug pin lands in the set bank.
        let gpio_words = &queued.data()[(blocks[4].source_address / 4) as usize..][..4];
        assert_eq!(gpio_words[0], 1 << DriverOptions::default().debug_gpio);
        assert_eq!(gpio_words[2], 0);

        // End winds back to the first data block.
        assert_eq!(
            blocks[5].next_control_block_address,
            CONTROL_BLOCK_BYTES
        );
    }

    /// Every GPIO write sits exactly EVENT_DELAY data words after the word
    /// its marker preceded.
    #[test]
    fn test_marker_alignment() {
        let mut stream = bitstream();
        for word in 0..6u32 {
            stream.append_bits(word, 32);
            if word == 1 {
                stream.mark_debug_start();
            }
            if word == 3 {
                stream.mark_debug_end();
            }
        }
        let queued = compiled(&stream);
        let blocks = queued.control_blocks();

        // Count the data words transferred ahead of each GPIO block.
        let mut words_before = Vec::new();
        let mut words = 0;
        for block in blocks {
            if is_fifo_block(block) {
                words += block.transfer_length / 4;
            }
            if is_gpio_block(block) {
                words_before.push(words);
            }
        }

        // Marker after word 1 refers to word 2 (the third word): the write
        // must follow EVENT_DELAY further words, and likewise for the marker
        // after word 3.
        assert_eq!(words_before, [2 + EVENT_DELAY, 4 + EVENT_DELAY]);
    }

    #[test]
    fn test_no_data_is_rejected() {
        let stream = bitstream();
        let mut queued = QueuedBitstream::new(PERIPHERAL_BUS_BASE, &DriverOptions::default());
        assert_eq!(queued.parse(&stream), Err(ParseError::ContainsNoData));

        let mut markers_only = bitstream();
        markers_only.mark_debug_start();
        let mut queued = QueuedBitstream::new(PERIPHERAL_BUS_BASE, &DriverOptions::default());
        assert_eq!(queued.parse(&markers_only), Err(ParseError::ContainsNoData));
    }

    #[test]
    fn test_empty_repeating_section_is_rejected() {
        let mut stream = bitstream();
        stream.append_bits(0xFFFF_FFFF, 32);
        stream.mark_loop_start();

        let mut queued = QueuedBitstream::new(PERIPHERAL_BUS_BASE, &DriverOptions::default());
        assert_eq!(queued.parse(&stream), Err(ParseError::ContainsNoData));
    }

    #[test]
    fn test_loop_start_excludes_prologue() {
        let mut stream = bitstream();
        stream.append_bits(0x1111_1111, 32);
        stream.mark_loop_start();
        stream.append_bits(0x2222_2222, 32);
        stream.append_bits(0x3333_3333, 32);
        let queued = compiled(&stream);
        let blocks = queued.control_blocks();

        // The end block must wind back to a block whose data does not include
        // the pre-loop word.
        let end = blocks.last().unwrap();
        let target_index =
            (end.next_control_block_address / CONTROL_BLOCK_BYTES) as usize;
        let target = &blocks[target_index];
        assert!(is_fifo_block(target));

        let words = &queued.data()
            [(target.source_address / 4) as usize..][..(target.transfer_length / 4) as usize];
        assert!(!words.contains(&0x1111_1111));
        assert!(words.contains(&0x2222_2222));
    }

    /// Walking the next chain from the end block returns to the loop target
    /// in a bounded number of steps.
    #[test]
    fn test_loop_chain_is_closed() {
        let mut stream = bitstream();
        stream.append_preamble();
        stream.mark_debug_start();
        stream.append_bits(0xAAAA_AAAA, 17);
        let queued = compiled(&stream);
        let blocks = queued.control_blocks();

        let mut index = (blocks.last().unwrap().next_control_block_address
            / CONTROL_BLOCK_BYTES) as usize;
        for _ in 0..blocks.len() {
            let next = blocks[index].next_control_block_address / CONTROL_BLOCK_BYTES;
            index = next as usize;
        }
        // Still inside the program after a full lap.
        assert!(index < blocks.len());
    }

    #[test]
    fn test_breakpoints_recorded() {
        let mut stream = bitstream();
        stream.append_bits(0xF0F0_F0F0, 32);
        stream.mark_breakpoint();
        stream.append_bits(0x0F0F_0F0F, 32);
        let queued = compiled(&stream);

        // One explicit breakpoint plus the end block's.
        assert_eq!(queued.breakpoints().len(), 2);
        let explicit = &queued.breakpoints()[0];
        let end = &queued.breakpoints()[1];
        assert!(explicit.control_block_offset() < end.control_block_offset());
        assert_eq!(
            end.control_block_offset(),
            queued.control_blocks().len() - 1
        );
    }

    #[test]
    fn test_transfer_chain_joins_program() {
        let mut stream = bitstream();
        stream.append_preamble();
        let mut queued = compiled(&stream);
        let primary_blocks = queued.control_blocks().len();

        let end_breakpoint = queued.breakpoints().last().unwrap().clone();
        let entry = queued.transfer_from(&stream, &end_breakpoint).unwrap();

        // The transfer chain begins with its own start block.
        assert!(entry >= primary_blocks);
        let start = &queued.control_blocks()[entry];
        assert_eq!(queued.data()[(start.source_address / 4) as usize], 1);

        // Every block of the chain eventually reaches the primary loop.
        let blocks = queued.control_blocks();
        let mut index = entry;
        for _ in 0..=blocks.len() {
            index = (blocks[index].next_control_block_address / CONTROL_BLOCK_BYTES) as usize;
            if index < primary_blocks {
                return;
            }
        }
        panic!("transfer chain never joined the primary program");
    }

    /// A transfer whose breakpoint state is already compiled somewhere needs
    /// no unrolled prologue: its start block jumps straight there.
    #[test]
    fn test_matching_transfer_jumps_directly() {
        let mut stream = bitstream();
        stream.append_preamble();
        let mut queued = compiled(&stream);

        let end_breakpoint = queued.breakpoints().last().unwrap().clone();
        // The first transfer unrolls a short prologue for the breakpoint's
        // state and leaves it compiled.
        queued.transfer_from(&stream, &end_breakpoint).unwrap();
        let after_first = queued.control_blocks().len();

        // An identical transfer is then a single start block jumping into it.
        let entry = queued.transfer_from(&stream, &end_breakpoint).unwrap();
        assert_eq!(queued.control_blocks().len(), after_first + 1);
        let target = queued.control_blocks()[entry].next_control_block_address
            / CONTROL_BLOCK_BYTES;
        assert!((target as usize) < after_first);
    }

    #[test]
    fn test_commit_rebases_addresses() {
        let mut stream = bitstream();
        stream.append_bits(0x1234_5678, 32);
        stream.mark_debug_start();
        stream.append_bits(0x9ABC_DEF0, 32);
        stream.append_bits(0x0F0F_0F0F, 32);

        let hardware = SimHardware::new();
        let mut queued = QueuedBitstream::new(hardware.peripheral_bus_base(), &DriverOptions::default());
        queued.parse(&stream).unwrap();

        let before = queued.control_blocks().to_vec();
        let control_bytes = before.len() as u32 * CONTROL_BLOCK_BYTES;
        queued.commit(&hardware).unwrap();
        let bus = queued.bus_address();

        for (index, (old, new)) in before
            .iter()
            .zip(queued.control_blocks().iter())
            .enumerate()
        {
            if old.source_address < PERIPHERAL_BUS_BASE {
                assert_eq!(
                    new.source_address,
                    old.source_address + bus + control_bytes,
                    "block {index} source"
                );
            } else {
                assert_eq!(new.source_address, old.source_address);
            }
            if old.destination_address < PERIPHERAL_BUS_BASE {
                assert_eq!(
                    new.destination_address,
                    old.destination_address + bus + control_bytes,
                    "block {index} destination"
                );
            } else {
                assert_eq!(new.destination_address, old.destination_address);
            }
            assert_eq!(
                new.next_control_block_address,
                old.next_control_block_address + bus,
                "block {index} next"
            );
        }

        // Flag word is live and starts at zero.
        assert!(!queued.is_transmitting());
        assert!(!queued.is_repeating());
    }

    #[test]
    #[should_panic(expected = "committed twice")]
    fn test_commit_twice_panics() {
        let mut stream = bitstream();
        stream.append_bits(1, 32);

        let hardware = SimHardware::new();
        let mut queued = QueuedBitstream::new(hardware.peripheral_bus_base(), &DriverOptions::default());
        queued.parse(&stream).unwrap();
        queued.commit(&hardware).unwrap();
        let _ = queued.commit(&hardware);
    }

    #[test]
    fn test_gpio_same_pin_later_event_wins() {
        let due = [GpioEvent::DebugStart, GpioEvent::DebugEnd];
        let mut queued = QueuedBitstream::new(PERIPHERAL_BUS_BASE, &DriverOptions::default());
        queued.data.push(0);
        queued.push_gpio_block(&due);

        let debug_bit = 1u32 << DriverOptions::default().debug_gpio;
        // DebugEnd came later: the pin must be cleared, not set.
        assert_eq!(queued.data[1], 0);
        assert_eq!(queued.data[3], debug_bit);

        // Every event kind maps to exactly one bank entry.
        for event in enum_iterator::all::<GpioEvent>() {
            let mut queued = QueuedBitstream::new(PERIPHERAL_BUS_BASE, &DriverOptions::default());
            queued.data.push(0);
            queued.push_gpio_block(&[event]);
            let words = &queued.data[1..5];
            assert_eq!(
                words.iter().filter(|&&word| word != 0).count(),
                1,
                "{event:?}"
            );
        }
    }

    #[test]
    fn test_termination_is_bounded() {
        // A deliberately awkward stream: markers straddling the loop edge and
        // mixed word sizes force several unrolling passes.
        let timing = SignalTiming::new(14.5).unwrap();
        let mut stream = Bitstream::with_word_size(timing, 8);
        stream.append_bits(0xAB, 8);
        stream.mark_loop_start();
        stream.append_bits(0x12, 8);
        stream.mark_debug_start();
        stream.append_bits(0x34, 8);
        stream.append_bits(0x5, 3);
        stream.mark_debug_end();
        stream.append_bits(0x77, 8);
        let queued = compiled(&stream);

        let events = stream.events().len();
        assert!(queued.control_blocks().len() <= events * 4 * 2 + 2);
    }
}
