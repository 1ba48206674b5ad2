//! Logical DCC commands and their serialisation to framed packet bytes.

use std::ops::RangeInclusive;

use crate::packer::{BitPacker, BitWriter, PackError};

pub use address::Address;
pub use instruction::{Direction, Instruction};

pub mod address;
pub mod instruction;

/// A field was given a value outside the range the wire format can carry.
///
/// Raised before any bit is written; the offending packet must not be sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field} out of range {}..={}", valid_range.start(), valid_range.end())]
pub struct OutOfRange {
    pub field: &'static str,
    pub valid_range: RangeInclusive<u32>,
}

pub(crate) fn check_range(
    field: &'static str,
    value: u32,
    valid_range: RangeInclusive<u32>,
) -> Result<(), OutOfRange> {
    if valid_range.contains(&value) {
        Ok(())
    } else {
        Err(OutOfRange { field, valid_range })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error(transparent)]
    OutOfRange(#[from] OutOfRange),
    #[error(transparent)]
    Pack(#[from] PackError),
}

/// An address plus the instructions sent to it, serialisable to the byte
/// sequence put on the wire (final byte is the XOR of all preceding bytes).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Packet {
    pub address: Address,
    pub instructions: Vec<Instruction>,
}

impl Packet {
    pub fn new(address: Address, instructions: Vec<Instruction>) -> Self {
        Packet { address, instructions }
    }

    /// The broadcast decoder-reset packet.
    pub fn reset() -> Self {
        Packet::new(Address::Broadcast, vec![Instruction::DecoderReset])
    }

    /// Broadcast stop with 28-step speed encoding.
    pub fn broadcast_stop(direction: Direction) -> Self {
        Packet::new(
            Address::Broadcast,
            vec![Instruction::Speed28 { speed: 0, direction }],
        )
    }

    /// Serialise address and instructions into the given packer.
    ///
    /// Framing (separators, error-detection byte, end bit) is the caller's
    /// concern; this writes the raw address and instruction bits only.
    pub fn pack_fields(&self, packer: &mut impl BitWriter) -> Result<(), OutOfRange> {
        self.address.pack(packer)?;
        for instruction in &self.instructions {
            instruction.pack(packer)?;
        }

        Ok(())
    }

    /// The packet's byte sequence, error-detection byte included.
    ///
    /// Fails with [`PackError::MalformedPacket`] when the combined fields do
    /// not end on a byte boundary.
    pub fn pack_bytes(&self) -> Result<Vec<u8>, PacketError> {
        let mut packer = BitPacker::bytes();
        self.pack_fields(&mut packer)?;

        if !packer.is_aligned() {
            return Err(PackError::MalformedPacket.into());
        }

        let mut bytes: Vec<u8> = packer.into_words().into_iter().map(|word| word as u8).collect();
        let error_byte = bytes.iter().fold(0, |acc, &byte| acc ^ byte);
        bytes.push(error_byte);

        Ok(bytes)
    }
}
