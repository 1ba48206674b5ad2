//! Software model of the peripherals and the DMA engine.
//!
//! Backs the test suites and the front-end's dry-run mode: registers are
//! plain memory behind mutexes, uncached allocations come from a fake bus
//! window, and an engine thread walks committed control blocks exactly as
//! the hardware would. The PWM model keeps a two-word FIFO pipeline, so
//! register writes the engine performs between FIFO pushes take effect
//! against the correct serialised word, which is the alignment the compiler's
//! event delay is built around.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::driver::control_block::{DmaControlBlock, TransferInformation, CONTROL_BLOCK_WORDS};
use crate::hardware::{
    AllocationError, BusAddress, ClockRegisters, ClockSource, DmaDebug, DmaRegisters,
    GpioFunction, GpioRegisters, Hardware, PwmRegisters, PwmStatus, UncachedMemory, GPIO_OFFSET,
    GPIO_OUTPUT_CLEAR_OFFSET, GPIO_OUTPUT_SET_OFFSET, PERIPHERAL_BUS_BASE,
    PWM_CHANNEL_1_RANGE_OFFSET, PWM_FIFO_OFFSET, PWM_OFFSET,
};

/// Fake bus window uncached allocations are handed out from.
const ALLOCATION_BUS_BASE: BusAddress = 0xC000_0000;

/// Words the modelled FIFO holds before the serialiser consumes one.
const FIFO_PIPELINE_WORDS: usize = 2;

const GPIO_PINS: usize = 54;
const DMA_CHANNELS: usize = 16;

/// Everything serialised out of the modelled PWM pin, plus the GPIO edges
/// the engine performed, positioned by physical bit.
#[derive(Debug, Default, Clone)]
pub struct SignalTrace {
    /// One entry per serialised physical bit.
    pub bits: Vec<bool>,
    /// `(physical bit position, pin, level)` per engine GPIO write.
    pub gpio_edges: Vec<(u64, usize, bool)>,
}

struct GpioState {
    functions: [GpioFunction; GPIO_PINS],
    levels: [bool; GPIO_PINS],
}

struct PwmState {
    enabled: bool,
    serializer: bool,
    dma_enabled: bool,
    dreq_threshold: u8,
    panic_threshold: u8,
    range1: u32,
    /// Words in flight, each with the range it will serialise under.
    fifo: VecDeque<(u32, u32)>,
    sticky_status: PwmStatus,
}

struct ClockState {
    running: bool,
    source: Option<ClockSource>,
    divisor: u32,
}

#[derive(Default)]
struct DmaChannelState {
    control_block_address: BusAddress,
    active: bool,
    error: bool,
    debug: DmaDebug,
}

struct SimAllocation {
    bus_address: BusAddress,
    words: Mutex<Vec<u32>>,
}

#[derive(Default)]
struct AllocationTable {
    next_offset: u32,
    entries: Vec<Weak<SimAllocation>>,
}

struct SimState {
    gpio: Mutex<GpioState>,
    pwm: Mutex<PwmState>,
    clock: Mutex<ClockState>,
    dma: Vec<Mutex<DmaChannelState>>,
    allocations: Mutex<AllocationTable>,
    trace: Mutex<SignalTrace>,
    blocks_executed: AtomicU64,
    stop: AtomicBool,
}

/// An uncached allocation backed by plain memory.
pub struct SimMemory {
    allocation: Arc<SimAllocation>,
}

impl UncachedMemory for SimMemory {
    fn bus_address(&self) -> BusAddress {
        self.allocation.bus_address
    }

    fn size(&self) -> usize {
        self.allocation.words.lock().unwrap().len() * 4
    }

    fn write_word(&self, word_offset: usize, value: u32) {
        self.allocation.words.lock().unwrap()[word_offset] = value;
    }

    fn read_word(&self, word_offset: usize) -> u32 {
        self.allocation.words.lock().unwrap()[word_offset]
    }
}

pub struct SimGpio {
    state: Arc<SimState>,
}

impl GpioRegisters for SimGpio {
    fn set_function(&self, pin: usize, function: GpioFunction) {
        self.state.gpio.lock().unwrap().functions[pin] = function;
    }

    fn function(&self, pin: usize) -> GpioFunction {
        self.state.gpio.lock().unwrap().functions[pin]
    }

    fn write_level(&self, pin: usize, level: bool) {
        self.state.gpio.lock().unwrap().levels[pin] = level;
    }

    fn level(&self, pin: usize) -> bool {
        self.state.gpio.lock().unwrap().levels[pin]
    }
}

pub struct SimPwm {
    state: Arc<SimState>,
}

impl PwmRegisters for SimPwm {
    fn disable(&self) {
        let mut pwm = self.state.pwm.lock().unwrap();
        pwm.enabled = false;
        pwm.serializer = false;
        pwm.dma_enabled = false;
    }

    fn enable_serializer(&self) {
        let mut pwm = self.state.pwm.lock().unwrap();
        pwm.enabled = true;
        pwm.serializer = true;
    }

    fn clear_fifo(&self) {
        self.state.pwm.lock().unwrap().fifo.clear();
    }

    fn write_fifo(&self, word: u32) {
        push_fifo(&self.state, word);
    }

    fn status(&self) -> PwmStatus {
        let pwm = self.state.pwm.lock().unwrap();
        let mut status = pwm.sticky_status;
        if pwm.fifo.len() >= FIFO_PIPELINE_WORDS {
            status |= PwmStatus::FIFO_FULL;
        }
        if pwm.fifo.is_empty() {
            status |= PwmStatus::FIFO_EMPTY;
        }
        if pwm.enabled {
            status |= PwmStatus::CHANNEL_1_TRANSMITTING;
        }
        status
    }

    fn clear_status(&self, status: PwmStatus) {
        let mut pwm = self.state.pwm.lock().unwrap();
        pwm.sticky_status &= !status;
    }

    fn enable_dma(&self, dreq_threshold: u8, panic_threshold: u8) {
        let mut pwm = self.state.pwm.lock().unwrap();
        pwm.dma_enabled = true;
        pwm.dreq_threshold = dreq_threshold;
        pwm.panic_threshold = panic_threshold;
    }
}

pub struct SimClock {
    state: Arc<SimState>,
}

impl ClockRegisters for SimClock {
    fn disable(&self) {
        self.state.clock.lock().unwrap().running = false;
    }

    fn is_running(&self) -> bool {
        self.state.clock.lock().unwrap().running
    }

    fn configure(&self, source: ClockSource, divisor: u32) {
        let mut clock = self.state.clock.lock().unwrap();
        debug_assert!(!clock.running, "clock reconfigured while running");
        clock.source = Some(source);
        clock.divisor = divisor;
    }

    fn enable(&self) {
        self.state.clock.lock().unwrap().running = true;
    }
}

pub struct SimDmaChannel {
    state: Arc<SimState>,
    channel: usize,
}

impl SimDmaChannel {
    fn with_state<T>(&self, body: impl FnOnce(&mut DmaChannelState) -> T) -> T {
        body(&mut self.state.dma[self.channel].lock().unwrap())
    }
}

impl DmaRegisters for SimDmaChannel {
    fn abort(&self) {
        self.with_state(|dma| dma.active = false);
    }

    fn reset(&self) {
        self.with_state(|dma| *dma = DmaChannelState::default());
    }

    fn set_control_block_address(&self, address: BusAddress) {
        self.with_state(|dma| dma.control_block_address = address);
    }

    fn control_block_address(&self) -> BusAddress {
        self.with_state(|dma| dma.control_block_address)
    }

    fn activate(&self, _priority: u8, _panic_priority: u8) {
        self.with_state(|dma| dma.active = true);
    }

    fn is_active(&self) -> bool {
        self.with_state(|dma| dma.active)
    }

    fn status(&self) -> crate::hardware::DmaStatus {
        self.with_state(|dma| {
            let mut status = crate::hardware::DmaStatus::empty();
            if dma.active {
                status |= crate::hardware::DmaStatus::ACTIVE;
            }
            if dma.error {
                status |= crate::hardware::DmaStatus::ERROR;
            }
            status
        })
    }

    fn clear_error(&self) {
        self.with_state(|dma| dma.error = false);
    }

    fn debug_status(&self) -> DmaDebug {
        self.with_state(|dma| dma.debug)
    }

    fn clear_debug(&self, debug: DmaDebug) {
        self.with_state(|dma| dma.debug &= !debug);
    }
}

/// The simulated SoC handle.
pub struct SimHardware {
    state: Arc<SimState>,
    gpio: SimGpio,
    pwm: SimPwm,
    clock: SimClock,
    dma: Vec<SimDmaChannel>,
    engine: Mutex<Option<JoinHandle<()>>>,
}

impl SimHardware {
    pub fn new() -> Self {
        let state = Arc::new(SimState {
            gpio: Mutex::new(GpioState {
                functions: [GpioFunction::Input; GPIO_PINS],
                levels: [false; GPIO_PINS],
            }),
            pwm: Mutex::new(PwmState {
                enabled: false,
                serializer: false,
                dma_enabled: false,
                dreq_threshold: 0,
                panic_threshold: 0,
                // Hardware reset value of the channel 1 range register.
                range1: 0x20,
                fifo: VecDeque::new(),
                sticky_status: PwmStatus::empty(),
            }),
            clock: Mutex::new(ClockState {
                running: false,
                source: None,
                divisor: 0,
            }),
            dma: (0..DMA_CHANNELS).map(|_| Mutex::new(DmaChannelState::default())).collect(),
            allocations: Mutex::new(AllocationTable::default()),
            trace: Mutex::new(SignalTrace::default()),
            blocks_executed: AtomicU64::new(0),
            stop: AtomicBool::new(false),
        });

        let engine_state = Arc::clone(&state);
        let engine = std::thread::spawn(move || run_engine(engine_state));

        SimHardware {
            gpio: SimGpio { state: Arc::clone(&state) },
            pwm: SimPwm { state: Arc::clone(&state) },
            clock: SimClock { state: Arc::clone(&state) },
            dma: (0..DMA_CHANNELS)
                .map(|channel| SimDmaChannel {
                    state: Arc::clone(&state),
                    channel,
                })
                .collect(),
            state,
            engine: Mutex::new(Some(engine)),
        }
    }

    /// Source and divisor last written to the clock manager.
    pub fn clock_configuration(&self) -> (Option<ClockSource>, u32) {
        let clock = self.state.clock.lock().unwrap();
        (clock.source, clock.divisor)
    }

    /// DREQ configuration last written to the PWM DMA control register.
    pub fn pwm_dma_configuration(&self) -> (bool, u8, u8) {
        let pwm = self.state.pwm.lock().unwrap();
        (pwm.dma_enabled, pwm.dreq_threshold, pwm.panic_threshold)
    }

    /// Latch sticky PWM error bits, as a fault on the real peripheral would.
    pub fn inject_pwm_errors(&self, errors: PwmStatus) {
        self.state.pwm.lock().unwrap().sticky_status |= errors;
    }

    /// Sticky PWM error bits currently latched.
    pub fn pwm_errors(&self) -> PwmStatus {
        self.state.pwm.lock().unwrap().sticky_status & PwmStatus::errors()
    }

    /// Copy of everything serialised so far.
    pub fn trace(&self) -> SignalTrace {
        self.state.trace.lock().unwrap().clone()
    }

    /// Control blocks the engine has executed so far.
    pub fn blocks_executed(&self) -> u64 {
        self.state.blocks_executed.load(Ordering::Relaxed)
    }
}

impl Default for SimHardware {
    fn default() -> Self {
        SimHardware::new()
    }
}

impl Drop for SimHardware {
    fn drop(&mut self) {
        self.state.stop.store(true, Ordering::Release);
        if let Some(engine) = self.engine.lock().unwrap().take() {
            let _ = engine.join();
        }
    }
}

impl Hardware for SimHardware {
    type Gpio = SimGpio;
    type Pwm = SimPwm;
    type Clock = SimClock;
    type DmaChannel = SimDmaChannel;
    type Memory = SimMemory;

    fn peripheral_bus_base(&self) -> BusAddress {
        PERIPHERAL_BUS_BASE
    }

    fn allocate_uncached(&self, min_bytes: usize) -> Result<SimMemory, AllocationError> {
        if min_bytes == 0 {
            return Err(AllocationError { requested: min_bytes });
        }

        let words = (min_bytes + 3) / 4;
        let mut table = self.state.allocations.lock().unwrap();

        let allocation = Arc::new(SimAllocation {
            bus_address: ALLOCATION_BUS_BASE + table.next_offset,
            words: Mutex::new(vec![0; words]),
        });
        // Keep the next allocation 32-byte aligned like the real allocator.
        table.next_offset += ((words as u32 * 4) + 31) & !31;
        table.entries.push(Arc::downgrade(&allocation));

        Ok(SimMemory { allocation })
    }

    fn gpio(&self) -> &SimGpio {
        &self.gpio
    }

    fn pwm(&self) -> &SimPwm {
        &self.pwm
    }

    fn clock(&self) -> &SimClock {
        &self.clock
    }

    fn dma_channel(&self, channel: usize) -> &SimDmaChannel {
        &self.dma[channel]
    }
}

/// Push one word into the modelled FIFO, serialising the word it displaces
/// out of the pipeline.
fn push_fifo(state: &Arc<SimState>, word: u32) {
    let mut pwm = state.pwm.lock().unwrap();
    let tag = pwm.range1;
    if pwm.fifo.len() < FIFO_PIPELINE_WORDS {
        pwm.fifo.push_back((word, tag));
        return;
    }

    let (displaced, range) = pwm.fifo.pop_front().unwrap();
    pwm.fifo.push_back((word, tag));
    let serialising = pwm.enabled && pwm.serializer;
    drop(pwm);

    if !serialising || range == 0 {
        return;
    }

    let mut trace = state.trace.lock().unwrap();
    for position in 0..range {
        let bit = if position < 32 {
            displaced >> (31 - position) & 1 != 0
        } else {
            false
        };
        trace.bits.push(bit);
    }
}

/// A range write lands before the serialiser loads the most recently pushed
/// word, so it takes effect from that word onward.
fn write_range(state: &Arc<SimState>, value: u32) {
    let mut pwm = state.pwm.lock().unwrap();
    pwm.range1 = value;
    if let Some(newest) = pwm.fifo.back_mut() {
        newest.1 = value;
    }
}

/// Apply a DMA write landing inside the peripheral window.
fn peripheral_write(state: &Arc<SimState>, address: BusAddress, value: u32) {
    match address - PERIPHERAL_BUS_BASE {
        offset if offset == PWM_OFFSET + PWM_FIFO_OFFSET => push_fifo(state, value),
        offset if offset == PWM_OFFSET + PWM_CHANNEL_1_RANGE_OFFSET => {
            write_range(state, value);
        }
        offset if offset == GPIO_OFFSET + GPIO_OUTPUT_SET_OFFSET => {
            write_gpio_bank(state, 0, value, true);
        }
        offset if offset == GPIO_OFFSET + GPIO_OUTPUT_SET_OFFSET + 4 => {
            write_gpio_bank(state, 1, value, true);
        }
        offset if offset == GPIO_OFFSET + GPIO_OUTPUT_CLEAR_OFFSET => {
            write_gpio_bank(state, 0, value, false);
        }
        offset if offset == GPIO_OFFSET + GPIO_OUTPUT_CLEAR_OFFSET + 4 => {
            write_gpio_bank(state, 1, value, false);
        }
        _ => {}
    }
}

fn write_gpio_bank(state: &Arc<SimState>, bank: usize, bits: u32, level: bool) {
    if bits == 0 {
        return;
    }

    let mut gpio = state.gpio.lock().unwrap();
    let mut trace = state.trace.lock().unwrap();
    let position = trace.bits.len() as u64;
    for bit in 0..32 {
        let pin = bank * 32 + bit;
        if pin < GPIO_PINS && bits & (1 << bit) != 0 {
            gpio.levels[pin] = level;
            trace.gpio_edges.push((position, pin, level));
        }
    }
}

fn read_bus(state: &Arc<SimState>, address: BusAddress) -> Result<u32, ()> {
    if address >= PERIPHERAL_BUS_BASE {
        // Peripheral reads are not modelled.
        return Ok(0);
    }

    let (allocation, offset) = resolve(state, address)?;
    let words = allocation.words.lock().unwrap();
    words.get(offset).copied().ok_or(())
}

fn write_bus(state: &Arc<SimState>, address: BusAddress, value: u32) -> Result<(), ()> {
    if address >= PERIPHERAL_BUS_BASE {
        peripheral_write(state, address, value);
        return Ok(());
    }

    let (allocation, offset) = resolve(state, address)?;
    let mut words = allocation.words.lock().unwrap();
    match words.get_mut(offset) {
        Some(slot) => {
            *slot = value;
            Ok(())
        }
        None => Err(()),
    }
}

fn resolve(state: &Arc<SimState>, address: BusAddress) -> Result<(Arc<SimAllocation>, usize), ()> {
    let table = state.allocations.lock().unwrap();
    for entry in &table.entries {
        if let Some(allocation) = entry.upgrade() {
            let size = allocation.words.lock().unwrap().len() as u32 * 4;
            if address >= allocation.bus_address && address < allocation.bus_address + size {
                let offset = ((address - allocation.bus_address) / 4) as usize;
                return Ok((Arc::clone(&allocation), offset));
            }
        }
    }
    Err(())
}

/// Fetch and perform one control block, returning the next block's address.
fn execute_block(state: &Arc<SimState>, address: BusAddress) -> Result<BusAddress, ()> {
    let (allocation, offset) = resolve(state, address)?;
    let words: Vec<u32> = {
        let memory = allocation.words.lock().unwrap();
        if offset + CONTROL_BLOCK_WORDS > memory.len() {
            return Err(());
        }
        memory[offset..offset + CONTROL_BLOCK_WORDS].to_vec()
    };

    let block = DmaControlBlock::new(
        TransferInformation::from_bits_truncate(words[0]),
        words[1],
        words[2],
        words[3],
        words[4],
        words[5],
    );

    let mut source = block.source_address;
    let mut destination = block.destination_address;
    for _row in 0..block.y_length() {
        for _ in 0..block.x_length() / 4 {
            let value = read_bus(state, source)?;
            write_bus(state, destination, value)?;

            if block
                .transfer_information
                .contains(TransferInformation::SRC_ADDRESS_INCREMENT)
            {
                source += 4;
            }
            if block
                .transfer_information
                .contains(TransferInformation::DEST_ADDRESS_INCREMENT)
            {
                destination += 4;
            }
        }

        if block.transfer_information.contains(TransferInformation::TD_MODE) {
            source = source.wrapping_add(block.source_stride() as i32 as u32);
            destination = destination.wrapping_add(block.destination_stride() as i32 as u32);
        }
    }

    state.blocks_executed.fetch_add(1, Ordering::Relaxed);
    Ok(block.next_control_block_address)
}

/// The engine thread: walks active channels until the simulator is dropped.
fn run_engine(state: Arc<SimState>) {
    while !state.stop.load(Ordering::Acquire) {
        let mut progressed = false;

        for channel in 0..DMA_CHANNELS {
            let (active, address) = {
                let dma = state.dma[channel].lock().unwrap();
                (dma.active, dma.control_block_address)
            };
            if !active || address == 0 {
                continue;
            }

            match execute_block(&state, address) {
                Ok(next) => {
                    let mut dma = state.dma[channel].lock().unwrap();
                    if dma.active {
                        dma.control_block_address = next;
                        if next == 0 {
                            dma.active = false;
                        }
                    }
                }
                Err(()) => {
                    let mut dma = state.dma[channel].lock().unwrap();
                    dma.error = true;
                    dma.debug |= DmaDebug::READ_ERROR;
                    dma.active = false;
                }
            }
            progressed = true;
        }

        if progressed {
            std::thread::sleep(Duration::from_micros(50));
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
