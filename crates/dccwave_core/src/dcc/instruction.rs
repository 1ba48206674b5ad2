//! DCC instruction families and their bit layouts.

use crate::dcc::{check_range, OutOfRange};
use crate::packer::BitWriter;

/// Travel direction carried by the speed instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Direction {
    Reverse,
    Forward,
}

impl Direction {
    fn bit(self) -> u32 {
        match self {
            Direction::Reverse => 0,
            Direction::Forward => 1,
        }
    }
}

/// An instruction appended to a packet after the address.
///
/// Speed fields use the decoder's step numbering: `0` is stop, `1..=n` are the
/// running steps. Function group fields are bit masks with bit 0 holding the
/// group's lowest-numbered function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Instruction {
    /// Re-initialise the decoder, erasing volatile state.
    DecoderReset,
    /// Ask the decoder to respond on the programming acknowledgement circuit.
    DecoderAckRequest,
    /// Set one of the decoder's configuration flags, `flag 0..=15`,
    /// `subaddress 0..=7`.
    DecoderFlagsSet { flag: u8, subaddress: u8 },
    /// Assign the decoder to consist `address` (`0` dissolves it).
    ConsistAssign { address: u8, direction: Direction },

    /// 14-step speed, with direct control of the headlight output.
    Speed14 {
        speed: u8,
        direction: Direction,
        headlight: bool,
    },
    /// 28-step speed.
    Speed28 { speed: u8, direction: Direction },
    /// 126-step speed via the advanced-operations instruction.
    Speed128 { speed: u8, direction: Direction },
    /// Emergency stop, 14-step encoding.
    EmergencyStop14 {
        direction: Direction,
        headlight: bool,
    },
    /// Emergency stop, 28-step encoding.
    EmergencyStop28 { direction: Direction },
    /// Emergency stop, 128-step encoding.
    EmergencyStop128 { direction: Direction },

    /// Functions F0-F4, bit 0 = F0.
    FunctionGroup1 { functions: u8 },
    /// Functions F5-F8, bit 0 = F5.
    FunctionGroup2 { functions: u8 },
    /// Functions F9-F12, bit 0 = F9.
    FunctionGroup3 { functions: u8 },
    /// Functions F13-F20, bit 0 = F13.
    FunctionGroup4 { functions: u8 },
    /// Functions F21-F28, bit 0 = F21.
    FunctionGroup5 { functions: u8 },

    /// Short-form binary state control, `address 0..=127` (`0` addresses all
    /// states).
    BinaryState { address: u8, value: bool },

    /// Write `value` to configuration variable `cv`, `1..=1024`.
    CvWrite { cv: u16, value: u8 },
    /// Ask the decoder to acknowledge if `cv` currently holds `value`.
    CvVerify { cv: u16, value: u8 },
    /// Write a single bit of a configuration variable, `bit 0..=7`.
    CvBitWrite { cv: u16, bit: u8, value: bool },
    /// Verify a single bit of a configuration variable.
    CvBitVerify { cv: u16, bit: u8, value: bool },
    /// Short-form CV access for the registers with dedicated opcodes,
    /// `register 1..=15`.
    CvShortWrite { register: u8, value: u8 },

    /// Basic accessory output selection; completes the byte the accessory
    /// address partition leaves open. `output 0..=7`.
    AccessoryOutput { output: u8, activate: bool },
    /// Extended accessory aspect, `0..=31`; follows a signal address.
    SignalAspect { aspect: u8 },
}

impl Instruction {
    /// Serialise the instruction bits into `packer`.
    pub fn pack(&self, packer: &mut impl BitWriter) -> Result<(), OutOfRange> {
        match *self {
            Instruction::DecoderReset => {
                packer.add(0b0000_0000, 8);
            }
            Instruction::DecoderAckRequest => {
                packer.add(0b0000_1111, 8);
            }
            Instruction::DecoderFlagsSet { flag, subaddress } => {
                check_range("decoder flag", flag as u32, 0..=15)?;
                check_range("decoder subaddress", subaddress as u32, 0..=7)?;

                packer.add(0b0000_0110, 8);
                packer.add(flag as u32, 4);
                packer.add(0, 1);
                packer.add(subaddress as u32, 3);
            }
            Instruction::ConsistAssign { address, direction } => {
                check_range("consist address", address as u32, 0..=127)?;

                packer.add(0b0001_001, 7);
                match direction {
                    Direction::Forward => packer.add(0, 1),
                    Direction::Reverse => packer.add(1, 1),
                }
                packer.add(address as u32, 8);
            }
            Instruction::Speed14 {
                speed,
                direction,
                headlight,
            } => {
                check_range("speed", speed as u32, 0..=14)?;

                packer.add(0b01, 2);
                packer.add(direction.bit(), 1);
                packer.add(headlight as u32, 1);
                let field = if speed == 0 { 0 } else { speed as u32 + 1 };
                packer.add(field, 4);
            }
            Instruction::Speed28 { speed, direction } => {
                check_range("speed", speed as u32, 0..=28)?;

                packer.add(0b01, 2);
                packer.add(direction.bit(), 1);
                if speed == 0 {
                    packer.add(0, 5);
                } else {
                    // The five-bit field carries the adjusted speed with its
                    // least significant bit moved to the front.
                    let adjusted = speed as u32 + 3;
                    packer.add(adjusted & 1, 1);
                    packer.add(adjusted >> 1, 4);
                }
            }
            Instruction::Speed128 { speed, direction } => {
                check_range("speed", speed as u32, 0..=126)?;

                packer.add(0b0011_1111, 8);
                packer.add(direction.bit(), 1);
                let field = if speed == 0 { 0 } else { speed as u32 + 1 };
                packer.add(field, 7);
            }
            Instruction::EmergencyStop14 {
                direction,
                headlight,
            } => {
                packer.add(0b01, 2);
                packer.add(direction.bit(), 1);
                packer.add(headlight as u32, 1);
                packer.add(0b0001, 4);
            }
            Instruction::EmergencyStop28 { direction } => {
                packer.add(0b01, 2);
                packer.add(direction.bit(), 1);
                packer.add(1, 1);
                packer.add(0, 4);
            }
            Instruction::EmergencyStop128 { direction } => {
                packer.add(0b0011_1111, 8);
                packer.add(direction.bit(), 1);
                packer.add(1, 7);
            }
            Instruction::FunctionGroup1 { functions } => {
                check_range("function group state", functions as u32, 0..=0b1_1111)?;

                packer.add(0b100, 3);
                // F0 rides ahead of F4..F1.
                packer.add(functions as u32 & 1, 1);
                packer.add(functions as u32 >> 1, 4);
            }
            Instruction::FunctionGroup2 { functions } => {
                check_range("function group state", functions as u32, 0..=0b1111)?;

                packer.add(0b1011, 4);
                packer.add(functions as u32, 4);
            }
            Instruction::FunctionGroup3 { functions } => {
                check_range("function group state", functions as u32, 0..=0b1111)?;

                packer.add(0b1010, 4);
                packer.add(functions as u32, 4);
            }
            Instruction::FunctionGroup4 { functions } => {
                packer.add(0b1101_1110, 8);
                packer.add(functions as u32, 8);
            }
            Instruction::FunctionGroup5 { functions } => {
                packer.add(0b1101_1111, 8);
                packer.add(functions as u32, 8);
            }
            Instruction::BinaryState { address, value } => {
                check_range("binary state address", address as u32, 0..=127)?;

                packer.add(0b1101_1101, 8);
                packer.add(value as u32, 1);
                packer.add(address as u32, 7);
            }
            Instruction::CvWrite { cv, value } => {
                Self::pack_cv_long(packer, 0b11, cv)?;
                packer.add(value as u32, 8);
            }
            Instruction::CvVerify { cv, value } => {
                Self::pack_cv_long(packer, 0b01, cv)?;
                packer.add(value as u32, 8);
            }
            Instruction::CvBitWrite { cv, bit, value } => {
                Self::pack_cv_bit(packer, cv, bit, value, true)?;
            }
            Instruction::CvBitVerify { cv, bit, value } => {
                Self::pack_cv_bit(packer, cv, bit, value, false)?;
            }
            Instruction::CvShortWrite { register, value } => {
                check_range("short cv register", register as u32, 1..=15)?;

                packer.add(0b1111, 4);
                packer.add(register as u32, 4);
                packer.add(value as u32, 8);
            }
            Instruction::AccessoryOutput { output, activate } => {
                check_range("accessory output", output as u32, 0..=7)?;

                packer.add(activate as u32, 1);
                packer.add(output as u32, 3);
            }
            Instruction::SignalAspect { aspect } => {
                check_range("signal aspect", aspect as u32, 0..=31)?;

                packer.add(0, 3);
                packer.add(aspect as u32, 5);
            }
        }

        Ok(())
    }

    /// `1110`, two operation bits, then the ten-bit CV number minus one.
    fn pack_cv_long(
        packer: &mut impl BitWriter,
        operation: u32,
        cv: u16,
    ) -> Result<(), OutOfRange> {
        check_range("cv", cv as u32, 1..=1024)?;

        packer.add(0b1110, 4);
        packer.add(operation, 2);
        packer.add(cv as u32 - 1, 10);

        Ok(())
    }

    fn pack_cv_bit(
        packer: &mut impl BitWriter,
        cv: u16,
        bit: u8,
        value: bool,
        write: bool,
    ) -> Result<(), OutOfRange> {
        check_range("cv bit", bit as u32, 0..=7)?;
        Self::pack_cv_long(packer, 0b10, cv)?;

        packer.add(0b111, 3);
        packer.add(write as u32, 1);
        packer.add(value as u32, 1);
        packer.add(bit as u32, 3);

        Ok(())
    }
}
