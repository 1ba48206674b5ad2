use std::sync::Arc;
use std::time::Duration;

use dccwave_core::bitstream::Bitstream;
use dccwave_core::dcc::Packet;
use dccwave_core::driver::{Driver, DriverOptions};
use dccwave_core::hardware::sim::{SignalTrace, SimHardware};
use dccwave_core::timing::SignalTiming;

pub fn timing() -> SignalTiming {
    SignalTiming::new(14.5).unwrap()
}

pub fn operations_bitstream(packet: &Packet, debug: bool) -> Bitstream {
    let mut bitstream = Bitstream::new(timing());
    bitstream
        .append_operations_mode_packet(packet, debug)
        .unwrap();
    bitstream
}

/// Transmit the given packets in order over the simulator, waiting for each
/// completion, and hand back the serialised trace.
pub fn transmit(packets: &[&Packet], debug: bool) -> SignalTrace {
    let hardware = Arc::new(SimHardware::new());
    let mut driver = Driver::new(Arc::clone(&hardware), DriverOptions::default());
    driver.startup();

    for packet in packets {
        let (sender, receiver) = crossbeam::channel::bounded(1);
        driver
            .enqueue(&operations_bitstream(packet, debug), move || {
                let _ = sender.send(());
            })
            .unwrap();
        receiver
            .recv_timeout(Duration::from_secs(10))
            .expect("transmission never completed");
    }

    // Let the loop spin a little past the last completion.
    std::thread::sleep(Duration::from_millis(20));
    driver.shutdown();

    hardware.trace()
}

/// One decoded logical bit with the physical position of its first pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalBit {
    pub value: bool,
    pub position: u64,
}

/// Fold the pulse trace back into logical bits: equal high and low runs of
/// the one-bit or zero-bit period. Leading idle zeros are skipped; decoding
/// stops at the first malformed pair (the trace usually ends mid-word).
pub fn decode_logical(bits: &[bool]) -> Vec<LogicalBit> {
    let one = timing().one_bit_length() as usize;
    let zero = timing().zero_bit_length() as usize;

    let mut out = Vec::new();
    let mut index = bits.iter().position(|&bit| bit).unwrap_or(bits.len());
    while index < bits.len() {
        let start = index;
        let high = run_length(bits, &mut index, true);
        let low = run_length(bits, &mut index, false);

        if high == low && (high == one || high == zero) {
            out.push(LogicalBit {
                value: high == one,
                position: start as u64,
            });
        } else {
            break;
        }
    }
    out
}

fn run_length(bits: &[bool], index: &mut usize, level: bool) -> usize {
    let start = *index;
    while *index < bits.len() && bits[*index] == level {
        *index += 1;
    }
    *index - start
}

/// A packet recovered from the logical bit sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub bytes: Vec<u8>,
    /// Physical position of the packet's first start bit.
    pub start_position: u64,
    /// Physical position just past the packet end bit.
    pub end_position: u64,
}

/// Scan for the next preamble-framed packet at or after `from`, returning it
/// and the logical index to continue scanning from.
pub fn find_packet(logical: &[LogicalBit], from: usize) -> Option<(DecodedPacket, usize)> {
    let one_bit_pulses = timing().one_bit_length() as u64 * 2;

    let mut ones = 0;
    let mut index = from;
    loop {
        if index >= logical.len() {
            return None;
        }
        if logical[index].value {
            ones += 1;
            index += 1;
            continue;
        }
        if ones >= 10 {
            break;
        }
        ones = 0;
        index += 1;
    }

    let start_position = logical[index].position;
    let mut bytes = Vec::new();
    loop {
        // A separator sits under the cursor; take the byte behind it.
        index += 1;
        if index + 8 > logical.len() {
            return None;
        }
        let mut byte = 0u8;
        for _ in 0..8 {
            byte = byte << 1 | logical[index].value as u8;
            index += 1;
        }
        bytes.push(byte);

        if index >= logical.len() {
            return None;
        }
        if logical[index].value {
            // Packet end bit.
            let end_position = logical[index].position + one_bit_pulses;
            return Some((
                DecodedPacket {
                    bytes,
                    start_position,
                    end_position,
                },
                index + 1,
            ));
        }
    }
}
