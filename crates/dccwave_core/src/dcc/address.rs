//! DCC address partitions.

use crate::dcc::{check_range, OutOfRange};
use crate::packer::BitWriter;

/// A decoder address.
///
/// Each partition serialises to a distinct bit prefix, so a decoder can tell
/// them apart from the first byte. The variant order here fixes the ordering
/// between partitions; within a partition addresses order numerically.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum Address {
    /// Every multi-function decoder.
    Broadcast,
    /// Short multi-function decoder address, `1..=127`.
    Primary(u16),
    /// Basic accessory decoder address, `1..=510`.
    Accessory(u16),
    /// Every basic accessory decoder.
    AccessoryBroadcast,
    /// Extended accessory (signal) decoder address, `1..=2046`.
    Signal(u16),
    /// Every extended accessory decoder.
    SignalBroadcast,
    /// Long multi-function decoder address, `0..=10239`.
    Extended(u16),
}

impl Address {
    /// Serialise the address bits into `packer`.
    ///
    /// The accessory and signal partitions intentionally stop short of a byte
    /// boundary; their output/aspect instructions complete the byte.
    pub fn pack(&self, packer: &mut impl BitWriter) -> Result<(), OutOfRange> {
        match *self {
            Address::Broadcast => {
                packer.add(0, 8);
            }
            Address::Primary(address) => {
                check_range("primary address", address as u32, 1..=127)?;

                packer.add(0, 1);
                packer.add(address as u32, 7);
            }
            Address::Accessory(address) => {
                check_range("accessory address", address as u32, 1..=510)?;

                Self::pack_accessory(packer, address as u32);
            }
            Address::AccessoryBroadcast => {
                Self::pack_accessory(packer, 0b1_1111_1111);
            }
            Address::Signal(address) => {
                check_range("signal address", address as u32, 1..=2046)?;

                Self::pack_signal(packer, address as u32);
            }
            Address::SignalBroadcast => {
                Self::pack_signal(packer, 0b111_1111_1111);
            }
            Address::Extended(address) => {
                check_range("extended address", address as u32, 0..=10239)?;

                packer.add(0b11, 2);
                packer.add(address as u32, 14);
            }
        }

        Ok(())
    }

    /// `10`, high six bits, `1`, ones-complement of the low three bits.
    fn pack_accessory(packer: &mut impl BitWriter, address: u32) {
        packer.add(0b10, 2);
        packer.add(address >> 3, 6);
        packer.add(1, 1);
        packer.add(!address & 0b111, 3);
    }

    /// `10`, bits 10-5, `0`, ones-complement of bits 4-2, `0`, bits 1-0, `1`.
    fn pack_signal(packer: &mut impl BitWriter, address: u32) {
        packer.add(0b10, 2);
        packer.add(address >> 5, 6);
        packer.add(0, 1);
        packer.add(!(address >> 2) & 0b111, 3);
        packer.add(0, 1);
        packer.add(address & 0b11, 2);
        packer.add(1, 1);
    }
}
