//! BCM2835 DMA engine descriptors.

use num_derive::FromPrimitive;

/// Bytes one control block occupies in memory (32-byte aligned stride).
pub const CONTROL_BLOCK_BYTES: u32 = 32;

/// Words one control block occupies.
pub const CONTROL_BLOCK_WORDS: usize = 8;

bitflags::bitflags! {
    /// Transfer-information word of a control block.
    pub struct TransferInformation: u32 {
        const INTERRUPT_ENABLE = 1 << 0;
        const TD_MODE = 1 << 1;
        const WAIT_FOR_WRITE_RESPONSE = 1 << 3;
        const DEST_ADDRESS_INCREMENT = 1 << 4;
        const DEST_WIDTH_128 = 1 << 5;
        const DEST_DREQ = 1 << 6;
        const DEST_IGNORE_WRITES = 1 << 7;
        const SRC_ADDRESS_INCREMENT = 1 << 8;
        const SRC_WIDTH_128 = 1 << 9;
        const SRC_DREQ = 1 << 10;
        const SRC_IGNORE_READS = 1 << 11;
        const PERIPHERAL_MAPPING = 0b1_1111 << 16;
        const NO_WIDE_BURSTS = 1 << 26;
    }
}

impl TransferInformation {
    /// Pace the transfer with `peripheral`'s data-request line.
    pub fn peripheral_mapping(peripheral: Peripheral) -> Self {
        TransferInformation::from_bits_truncate((peripheral as u32) << 16)
    }

    /// The peripheral this transfer is paced by, if any.
    pub fn peripheral(&self) -> Option<Peripheral> {
        num_traits::FromPrimitive::from_u32((self.bits() >> 16) & 0b1_1111)
    }
}

/// Data-request source peripherals (the PERMAP field values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum Peripheral {
    Always = 0,
    Dsi = 1,
    PcmTx = 2,
    PcmRx = 3,
    Smi = 4,
    Pwm = 5,
    SpiTx = 6,
    SpiRx = 7,
}

/// One eight-word DMA engine descriptor.
///
/// Until the owning bitstream is committed, `source_address`,
/// `destination_address` and `next_control_block_address` hold offsets
/// relative to the owning buffer; commit rebases them to bus addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DmaControlBlock {
    pub transfer_information: TransferInformation,
    pub source_address: u32,
    pub destination_address: u32,
    pub transfer_length: u32,
    pub stride: u32,
    pub next_control_block_address: u32,
    reserved: [u32; 2],
}

impl DmaControlBlock {
    pub fn new(
        transfer_information: TransferInformation,
        source_address: u32,
        destination_address: u32,
        transfer_length: u32,
        stride: u32,
        next_control_block_address: u32,
    ) -> Self {
        DmaControlBlock {
            transfer_information,
            source_address,
            destination_address,
            transfer_length,
            stride,
            next_control_block_address,
            reserved: [0; 2],
        }
    }

    /// The block exactly as the engine reads it from memory.
    pub fn words(&self) -> [u32; CONTROL_BLOCK_WORDS] {
        [
            self.transfer_information.bits(),
            self.source_address,
            self.destination_address,
            self.transfer_length,
            self.stride,
            self.next_control_block_address,
            0,
            0,
        ]
    }

    /// Encode a two-dimensional transfer length: `x` bytes per row, `y` rows.
    pub fn transfer_length_2d(x_bytes: u32, y_rows: u32) -> u32 {
        debug_assert!(x_bytes <= 0xFFFF && y_rows <= 0x3FFF);
        x_bytes | y_rows << 16
    }

    /// Encode the signed source and destination strides applied after each
    /// row of a two-dimensional transfer.
    pub fn stride_2d(source: i16, destination: i16) -> u32 {
        (source as u16 as u32) | (destination as u16 as u32) << 16
    }

    /// Bytes per row; the whole length for a linear transfer.
    pub fn x_length(&self) -> u32 {
        if self.transfer_information.contains(TransferInformation::TD_MODE) {
            self.transfer_length & 0xFFFF
        } else {
            self.transfer_length
        }
    }

    /// Rows transferred; 1 for a linear transfer.
    pub fn y_length(&self) -> u32 {
        if self.transfer_information.contains(TransferInformation::TD_MODE) {
            (self.transfer_length >> 16) & 0x3FFF
        } else {
            1
        }
    }

    pub fn source_stride(&self) -> i16 {
        (self.stride & 0xFFFF) as u16 as i16
    }

    pub fn destination_stride(&self) -> i16 {
        (self.stride >> 16) as u16 as i16
    }
}
