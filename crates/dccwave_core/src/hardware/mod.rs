//! Abstract view of the SoC peripherals the signal core drives.
//!
//! The driver and compiler only ever talk to these traits; register semantics
//! follow the BCM2835 GPIO, PWM, clock-manager and DMA blocks, and the
//! simulator in [`sim`] models them in software.

use num_derive::FromPrimitive;

pub mod sim;

/// An address as the DMA engine sees it.
pub type BusAddress = u32;

/// Bus address at which the peripheral window appears.
pub const PERIPHERAL_BUS_BASE: BusAddress = 0x7E00_0000;

// Register block offsets inside the peripheral window.
pub const GPIO_OFFSET: u32 = 0x20_0000;
pub const CLOCK_OFFSET: u32 = 0x10_1000;
pub const DMA_OFFSET: u32 = 0x00_7000;
pub const PWM_OFFSET: u32 = 0x20_C000;

// Registers inside the GPIO block.
pub const GPIO_OUTPUT_SET_OFFSET: u32 = 0x1C;
pub const GPIO_OUTPUT_CLEAR_OFFSET: u32 = 0x28;

// Registers inside the PWM block.
pub const PWM_CHANNEL_1_RANGE_OFFSET: u32 = 0x10;
pub const PWM_FIFO_OFFSET: u32 = 0x18;

/// Function select for a GPIO pin (the three-bit FSEL field encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum GpioFunction {
    Input = 0b000,
    Output = 0b001,
    Alternate0 = 0b100,
    Alternate1 = 0b101,
    Alternate2 = 0b110,
    Alternate3 = 0b111,
    Alternate4 = 0b011,
    Alternate5 = 0b010,
}

pub trait GpioRegisters {
    fn set_function(&self, pin: usize, function: GpioFunction);
    fn function(&self, pin: usize) -> GpioFunction;
    /// Drive the pin's output latch.
    fn write_level(&self, pin: usize, level: bool);
    fn level(&self, pin: usize) -> bool;
}

bitflags::bitflags! {
    /// PWM status register bits.
    pub struct PwmStatus: u32 {
        const FIFO_FULL = 1 << 0;
        const FIFO_EMPTY = 1 << 1;
        const FIFO_WRITE_ERROR = 1 << 2;
        const FIFO_READ_ERROR = 1 << 3;
        const GAP_OCCURRED_1 = 1 << 4;
        const GAP_OCCURRED_2 = 1 << 5;
        const BUS_ERROR = 1 << 8;
        const CHANNEL_1_TRANSMITTING = 1 << 9;
        const CHANNEL_2_TRANSMITTING = 1 << 10;
    }
}

impl PwmStatus {
    /// The sticky error conditions the watchdog scans for.
    pub fn errors() -> Self {
        PwmStatus::FIFO_WRITE_ERROR
            | PwmStatus::FIFO_READ_ERROR
            | PwmStatus::GAP_OCCURRED_1
            | PwmStatus::GAP_OCCURRED_2
            | PwmStatus::BUS_ERROR
    }
}

pub trait PwmRegisters {
    /// Stop both channels and clear the control register.
    fn disable(&self);
    /// Channel 1 in serialiser mode, reading words from the FIFO.
    fn enable_serializer(&self);
    fn clear_fifo(&self);
    fn write_fifo(&self, word: u32);
    fn status(&self) -> PwmStatus;
    /// Write-1-to-clear the given status bits.
    fn clear_status(&self, status: PwmStatus);
    /// Enable DREQ generation with the given thresholds.
    fn enable_dma(&self, dreq_threshold: u8, panic_threshold: u8);
}

/// Clock-manager sources (the SRC field encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum ClockSource {
    Oscillator = 1,
    PllA = 4,
    PllC = 5,
    PllD = 6,
    Hdmi = 7,
}

impl ClockSource {
    /// Source frequency in MHz.
    pub fn frequency(self) -> f32 {
        match self {
            ClockSource::Oscillator => 19.2,
            ClockSource::PllA => 393.216,
            ClockSource::PllC => 1000.0,
            ClockSource::PllD => 500.0,
            ClockSource::Hdmi => 216.0,
        }
    }
}

pub trait ClockRegisters {
    fn disable(&self);
    fn is_running(&self) -> bool;
    /// Set source and integer divisor; only valid while the clock is stopped.
    fn configure(&self, source: ClockSource, divisor: u32);
    fn enable(&self);
}

bitflags::bitflags! {
    /// DMA channel control/status register bits.
    pub struct DmaStatus: u32 {
        const ACTIVE = 1 << 0;
        const END = 1 << 1;
        const INTERRUPTED = 1 << 2;
        const DREQ = 1 << 3;
        const PAUSED = 1 << 4;
        const WAITING_FOR_OUTSTANDING_WRITES = 1 << 6;
        const ERROR = 1 << 8;
    }
}

bitflags::bitflags! {
    /// DMA channel debug register bits.
    pub struct DmaDebug: u32 {
        const READ_LAST_NOT_SET_ERROR = 1 << 0;
        const FIFO_ERROR = 1 << 1;
        const READ_ERROR = 1 << 2;
    }
}

impl DmaDebug {
    pub fn errors() -> Self {
        DmaDebug::READ_LAST_NOT_SET_ERROR | DmaDebug::FIFO_ERROR | DmaDebug::READ_ERROR
    }
}

impl Default for DmaDebug {
    fn default() -> Self {
        DmaDebug::empty()
    }
}

pub trait DmaRegisters {
    /// Abort the current control block and stop the channel.
    fn abort(&self);
    /// Full channel reset.
    fn reset(&self);
    fn set_control_block_address(&self, address: BusAddress);
    fn control_block_address(&self) -> BusAddress;
    /// Set ACTIVE with the given priority levels.
    fn activate(&self, priority: u8, panic_priority: u8);
    fn is_active(&self) -> bool;
    fn status(&self) -> DmaStatus;
    fn clear_error(&self);
    fn debug_status(&self) -> DmaDebug;
    fn clear_debug(&self, debug: DmaDebug);
}

/// A bus-addressable allocation shared between the CPU and the DMA engine.
///
/// Reads and writes go around the CPU caches so both sides agree on the
/// contents without cache maintenance.
pub trait UncachedMemory: Send + 'static {
    fn bus_address(&self) -> BusAddress;
    fn size(&self) -> usize;
    fn write_word(&self, word_offset: usize, value: u32);
    fn read_word(&self, word_offset: usize) -> u32;

    fn write_words(&self, word_offset: usize, values: &[u32]) {
        for (index, &value) in values.iter().enumerate() {
            self.write_word(word_offset + index, value);
        }
    }
}

/// The uncached allocator refused the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("uncached memory allocation of {requested} bytes failed")]
pub struct AllocationError {
    pub requested: usize,
}

/// Handle to the SoC: the uncached allocator plus typed register views.
pub trait Hardware: Send + Sync + 'static {
    type Gpio: GpioRegisters;
    type Pwm: PwmRegisters;
    type Clock: ClockRegisters;
    type DmaChannel: DmaRegisters;
    type Memory: UncachedMemory;

    fn peripheral_bus_base(&self) -> BusAddress;
    fn allocate_uncached(&self, min_bytes: usize) -> Result<Self::Memory, AllocationError>;

    fn gpio(&self) -> &Self::Gpio;
    fn pwm(&self) -> &Self::Pwm;
    fn clock(&self) -> &Self::Clock;
    fn dma_channel(&self, channel: usize) -> &Self::DmaChannel;

    fn pwm_fifo_bus_address(&self) -> BusAddress {
        self.peripheral_bus_base() + PWM_OFFSET + PWM_FIFO_OFFSET
    }

    fn pwm_range_bus_address(&self) -> BusAddress {
        self.peripheral_bus_base() + PWM_OFFSET + PWM_CHANNEL_1_RANGE_OFFSET
    }

    fn gpio_output_set_bus_address(&self) -> BusAddress {
        self.peripheral_bus_base() + GPIO_OFFSET + GPIO_OUTPUT_SET_OFFSET
    }
}
