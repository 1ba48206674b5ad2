//! The ordered event sequence a queued bitstream is compiled from.

use crate::dcc::{Packet, PacketError};
use crate::packer::{BitWriter, PacketPacker};
use crate::timing::SignalTiming;
use crate::utils::mask;

/// One element of a bitstream.
///
/// Marker events always precede the `Data` event they are synchronised with:
/// a marker refers to the start of the *next* data word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitstreamEvent {
    /// `size` physical bits, msb-aligned within the stream's word size.
    Data { word: u32, size: u32 },
    /// Switch the booster output off for the RailCom cutout.
    RailComCutoutStart,
    /// Switch the booster output back on.
    RailComCutoutEnd,
    /// Raise the debug GPIO.
    DebugStart,
    /// Lower the debug GPIO.
    DebugEnd,
    /// Everything after this point repeats; everything before plays once.
    LoopStart,
    /// Transmission may transfer onto another queued bitstream here.
    Breakpoint,
}

/// Append-only sequence of events describing the physical signal.
///
/// Adjacent data is collapsed into words of `word_size` bits: appending to a
/// stream whose last event is a partial data word extends that word in place.
#[derive(Debug, Clone)]
pub struct Bitstream {
    timing: SignalTiming,
    word_size: u32,
    events: Vec<BitstreamEvent>,
    /// Physical bits appended so far, for duration accounting.
    bit_count: u64,
}

impl Bitstream {
    pub fn new(timing: SignalTiming) -> Self {
        Bitstream::with_word_size(timing, crate::WORD_SIZE)
    }

    /// A bitstream with a non-standard word size; sizes below 32 are only
    /// used by tests and tooling.
    pub fn with_word_size(timing: SignalTiming, word_size: u32) -> Self {
        assert!((1..=32).contains(&word_size));

        Bitstream {
            timing,
            word_size,
            events: Vec::new(),
            bit_count: 0,
        }
    }

    pub fn events(&self) -> &[BitstreamEvent] {
        &self.events
    }

    pub fn word_size(&self) -> u32 {
        self.word_size
    }

    pub fn timing(&self) -> SignalTiming {
        self.timing
    }

    /// Duration of one physical bit in microseconds.
    pub fn bit_duration(&self) -> f32 {
        self.timing.pulse_width()
    }

    /// Time one full playback of the stream takes.
    pub fn duration_us(&self) -> f32 {
        self.bit_count as f32 * self.timing.pulse_width()
    }

    /// Append the least significant `count` physical bits of `bits`.
    pub fn append_bits(&mut self, bits: u32, count: u32) {
        assert!((1..=u32::BITS).contains(&count), "invalid bit count {count}");

        self.bit_count += count as u64;

        let mut count = count;
        while count > 0 {
            // Extend a trailing partial word in place.
            if let Some(BitstreamEvent::Data { word, size }) = self.events.last_mut() {
                if *size < self.word_size {
                    let take = count.min(self.word_size - *size);
                    let chunk = (bits >> (count - take)) & mask(take);
                    *word |= chunk << (self.word_size - *size - take);
                    *size += take;
                    count -= take;
                    continue;
                }
            }

            let take = count.min(self.word_size);
            let chunk = (bits >> (count - take)) & mask(take);
            self.events.push(BitstreamEvent::Data {
                word: chunk << (self.word_size - take),
                size: take,
            });
            count -= take;
        }
    }

    /// Append `count` physical bits of constant `level`.
    fn append_run(&mut self, level: bool, count: u32) {
        let mut count = count;
        while count > 0 {
            let take = count.min(u32::BITS);
            self.append_bits(if level { mask(take) } else { 0 }, take);
            count -= take;
        }
    }

    /// Append one logical bit as its high/low pulse pair.
    pub fn append_logical_bit(&mut self, bit: bool) {
        let length = if bit {
            self.timing.one_bit_length()
        } else {
            self.timing.zero_bit_length()
        };

        self.append_run(true, length);
        self.append_run(false, length);
    }

    /// Append the synchronisation preamble.
    pub fn append_preamble(&mut self) {
        for _ in 0..crate::PREAMBLE_LENGTH {
            self.append_logical_bit(true);
        }
    }

    /// Append already-framed packet bytes: a `0` ahead of each byte, the
    /// byte's bits msb-first, and the final `1` end bit.
    pub fn append_packet_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.append_logical_bit(false);
            for bit in (0..8).rev() {
                self.append_logical_bit(byte & (1 << bit) != 0);
            }
        }
        self.append_logical_bit(true);
    }

    /// Append the RailCom cutout: one bits covering the cutout window, with
    /// the booster-off marker spliced in after the cutout delay and the
    /// booster-on marker at the end of the window.
    pub fn append_railcom_cutout(&mut self) {
        let timing = self.timing;
        let mut markers = [
            (timing.railcom_delay_length(), BitstreamEvent::RailComCutoutStart),
            (timing.railcom_length(), BitstreamEvent::RailComCutoutEnd),
        ]
        .into_iter()
        .peekable();

        let mut position = 0;
        for _ in 0..timing.railcom_count() {
            for level in [true, false] {
                let mut run = timing.one_bit_length();
                while run > 0 {
                    while let Some(&(at, event)) = markers.peek() {
                        if at == position {
                            self.events.push(event);
                            markers.next();
                        } else {
                            break;
                        }
                    }

                    let take = match markers.peek() {
                        Some(&(at, _)) => run.min(at - position),
                        None => run,
                    };
                    self.append_run(level, take);
                    position += take;
                    run -= take;
                }
            }
        }

        // A marker landing exactly on the end of the cutout attaches to
        // whatever data follows.
        while let Some(&(at, event)) = markers.peek() {
            if at == position {
                self.events.push(event);
                markers.next();
            } else {
                break;
            }
        }
    }

    /// Append a complete operations-mode transmission: preamble, packet and
    /// RailCom cutout, optionally bracketed by the debug markers.
    pub fn append_operations_mode_packet(
        &mut self,
        packet: &Packet,
        debug: bool,
    ) -> Result<(), PacketError> {
        // Validate every field up front so a rejected packet leaves the
        // stream untouched.
        packet.pack_bytes()?;

        self.append_preamble();
        if debug {
            self.mark_debug_start();
        }

        let mut packer = PacketPacker::new(LogicalBits(self));
        packet.pack_fields(&mut packer)?;
        packer.finish()?;

        self.append_railcom_cutout();
        if debug {
            self.mark_debug_end();
        }

        Ok(())
    }

    /// Raise the debug GPIO alongside the next data word.
    pub fn mark_debug_start(&mut self) {
        self.events.push(BitstreamEvent::DebugStart);
    }

    /// Lower the debug GPIO alongside the next data word.
    pub fn mark_debug_end(&mut self) {
        self.events.push(BitstreamEvent::DebugEnd);
    }

    /// Mark the start of the repeating section.
    pub fn mark_loop_start(&mut self) {
        self.events.push(BitstreamEvent::LoopStart);
    }

    /// Mark a point where a following bitstream may take over transmission.
    pub fn mark_breakpoint(&mut self) {
        self.events.push(BitstreamEvent::Breakpoint);
    }
}

/// Adapts a bitstream into a [`BitWriter`] expanding every framed packet bit
/// into its physical pulse train.
struct LogicalBits<'a>(&'a mut Bitstream);

impl BitWriter for LogicalBits<'_> {
    fn add(&mut self, value: u32, length: u32) {
        assert!((1..=u32::BITS).contains(&length));

        for bit in (0..length).rev() {
            self.0.append_logical_bit(value & (1 << bit) != 0);
        }
    }
}
