use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use owo_colors::OwoColorize;

use dccwave_core::bitstream::Bitstream;
use dccwave_core::driver::{Driver, DriverOptions};
use dccwave_core::hardware::sim::SimHardware;
use dccwave_core::timing::SignalTiming;

use crate::args::PacketArgs;

#[derive(clap::Args, Debug)]
pub struct RunCommand {
    #[clap(flatten)]
    packet: PacketArgs,
    /// Seconds to keep the transmission looping after the first playback
    #[clap(long, default_value_t = 0.5)]
    seconds: f32,
    /// Bracket the packet with the debug GPIO markers
    #[clap(long)]
    debug: bool,
}

pub fn handle_run(command: RunCommand, options: DriverOptions) -> anyhow::Result<()> {
    let packet = command.packet.to_packet()?;
    let timing = SignalTiming::new(options.pulse_width)?;

    let mut bitstream = Bitstream::new(timing);
    bitstream.append_operations_mode_packet(&packet, command.debug)?;

    let hardware = Arc::new(SimHardware::new());
    let mut driver = Driver::new(Arc::clone(&hardware), options);
    driver.startup();

    let (sender, receiver) = crossbeam::channel::bounded(1);
    driver
        .enqueue(&bitstream, move || {
            let _ = sender.send(());
        })
        .context("could not queue the bitstream")?;

    receiver
        .recv_timeout(Duration::from_secs(10))
        .context("transmission never completed")?;
    println!("{} first playback complete", "Transmitted".bright_green());

    std::thread::sleep(Duration::from_secs_f32(command.seconds));
    driver.shutdown();

    let trace = hardware.trace();
    println!(
        "{} {} physical bits, {} GPIO edges, {} control blocks executed",
        "Simulated".bright_green(),
        trace.bits.len(),
        trace.gpio_edges.len(),
        hardware.blocks_executed()
    );

    Ok(())
}
