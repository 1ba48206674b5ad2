use std::sync::Arc;
use std::time::Duration;

use dccwave_core::bitstream::Bitstream;
use dccwave_core::dcc::{Address, Direction, Instruction, Packet};
use dccwave_core::driver::{Driver, DriverOptions};
use dccwave_core::hardware::sim::SimHardware;

use crate::setup::{self, decode_logical, find_packet};

fn speed_packet(address: u16, speed: u8) -> Packet {
    Packet::new(
        Address::Primary(address),
        vec![Instruction::Speed28 {
            speed,
            direction: Direction::Forward,
        }],
    )
}

#[test]
fn test_waveform_carries_the_packet() {
    let packet = speed_packet(3, 14);
    let trace = setup::transmit(&[&packet], false);

    let logical = decode_logical(&trace.bits);
    let (decoded, _) = find_packet(&logical, 0).expect("no packet in the trace");

    assert_eq!(decoded.bytes, packet.pack_bytes().unwrap());
    assert_eq!(
        decoded.bytes.iter().fold(0, |acc, &byte| acc ^ byte),
        0,
        "error-detection byte must cancel the packet"
    );
}

#[test]
fn test_waveform_repeats_the_packet() {
    let packet = speed_packet(40, 7);
    let trace = setup::transmit(&[&packet], false);
    let logical = decode_logical(&trace.bits);

    let mut found = 0;
    let mut from = 0;
    while let Some((decoded, next)) = find_packet(&logical, from) {
        assert_eq!(decoded.bytes, packet.pack_bytes().unwrap());
        found += 1;
        from = next;
    }

    assert!(found >= 2, "expected several playbacks, decoded {found}");
}

#[test]
fn test_cutout_switches_the_booster_pin() {
    let packet = speed_packet(3, 14);
    let trace = setup::transmit(&[&packet], false);
    let timing = setup::timing();

    let logical = decode_logical(&trace.bits);
    let (decoded, _) = find_packet(&logical, 0).expect("no packet in the trace");

    // The booster switches off after the cutout delay and back on at the end
    // of the cutout window, both measured from the end of the end bit.
    let railcom = 17;
    let (clear_position, _, _) = trace
        .gpio_edges
        .iter()
        .find(|&&(position, pin, level)| {
            pin == railcom && !level && position >= decoded.end_position
        })
        .expect("no booster-off edge after the packet");
    assert_eq!(
        *clear_position,
        decoded.end_position + timing.railcom_delay_length() as u64
    );

    let (set_position, _, _) = trace
        .gpio_edges
        .iter()
        .find(|&&(position, pin, level)| pin == railcom && level && position > *clear_position)
        .expect("no booster-on edge after the cutout began");
    assert_eq!(
        *set_position,
        decoded.end_position + timing.railcom_length() as u64
    );
}

#[test]
fn test_debug_pin_brackets_the_packet() {
    let packet = speed_packet(3, 14);
    let trace = setup::transmit(&[&packet], true);

    let logical = decode_logical(&trace.bits);
    let (decoded, _) = find_packet(&logical, 0).expect("no packet in the trace");

    let debug = 19;
    assert!(
        trace
            .gpio_edges
            .iter()
            .any(|&(position, pin, level)| pin == debug
                && level
                && position == decoded.start_position),
        "debug pin must rise exactly at the packet start bit"
    );
    assert!(
        trace
            .gpio_edges
            .iter()
            .any(|&(position, pin, level)| pin == debug
                && !level
                && position > decoded.end_position),
        "debug pin must fall after the packet"
    );
}

#[test]
fn test_waveform_carries_a_cv_access_packet() {
    let packet = Packet::new(
        Address::Primary(9),
        vec![Instruction::CvWrite { cv: 8, value: 3 }],
    );
    let trace = setup::transmit(&[&packet], false);

    let logical = decode_logical(&trace.bits);
    let (decoded, _) = find_packet(&logical, 0).expect("no packet in the trace");

    let expected = packet.pack_bytes().unwrap();
    assert_eq!(expected.len(), 5);
    assert_eq!(decoded.bytes, expected);
}

/// A successor may take over at an explicitly marked breakpoint partway
/// through the predecessor, not only at its end block.
#[test]
fn test_transfer_at_marked_breakpoint() {
    let first = speed_packet(3, 10);
    let second = speed_packet(4, 12);
    let replacement = speed_packet(5, 20);

    let mut stream = Bitstream::new(setup::timing());
    stream
        .append_operations_mode_packet(&first, false)
        .unwrap();
    stream.mark_breakpoint();
    stream
        .append_operations_mode_packet(&second, false)
        .unwrap();

    let hardware = Arc::new(SimHardware::new());
    let mut driver = Driver::new(Arc::clone(&hardware), DriverOptions::default());
    driver.startup();

    for bitstream in [&stream, &setup::operations_bitstream(&replacement, false)] {
        let (sender, receiver) = crossbeam::channel::bounded(1);
        driver
            .enqueue(bitstream, move || {
                let _ = sender.send(());
            })
            .unwrap();
        receiver
            .recv_timeout(Duration::from_secs(10))
            .expect("transmission never completed");
    }
    std::thread::sleep(Duration::from_millis(20));
    driver.shutdown();

    let logical = decode_logical(&hardware.trace().bits);
    let replacement_bytes = replacement.pack_bytes().unwrap();

    let mut decoded = Vec::new();
    let mut from = 0;
    while let Some((packet, next)) = find_packet(&logical, from) {
        decoded.push(packet.bytes);
        from = next;
    }

    let switch = decoded
        .iter()
        .position(|bytes| *bytes == replacement_bytes)
        .expect("replacement never played");
    assert!(
        decoded[switch..].iter().all(|bytes| *bytes == replacement_bytes),
        "predecessor reappeared after the switch"
    );
    // Everything before the switch came from the original pair.
    let originals = [first.pack_bytes().unwrap(), second.pack_bytes().unwrap()];
    assert!(decoded[..switch].iter().all(|bytes| originals.contains(bytes)));
}

#[test]
fn test_queued_successor_takes_over() {
    let first = speed_packet(3, 10);
    let second = speed_packet(3, 20);
    let trace = setup::transmit(&[&first, &second], false);

    let logical = decode_logical(&trace.bits);
    let first_bytes = first.pack_bytes().unwrap();
    let second_bytes = second.pack_bytes().unwrap();

    let mut decoded = Vec::new();
    let mut from = 0;
    while let Some((packet, next)) = find_packet(&logical, from) {
        decoded.push(packet.bytes);
        from = next;
    }

    assert!(decoded.contains(&first_bytes), "first packet never played");
    assert!(decoded.contains(&second_bytes), "second packet never played");

    // Once the successor appears, the predecessor never does again.
    let switch = decoded
        .iter()
        .position(|bytes| *bytes == second_bytes)
        .unwrap();
    assert!(
        decoded[switch..].iter().all(|bytes| *bytes == second_bytes),
        "predecessor reappeared after the switch"
    );
}
