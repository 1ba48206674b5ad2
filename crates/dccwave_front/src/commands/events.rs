use dccwave_core::bitstream::{Bitstream, BitstreamEvent};
use dccwave_core::driver::DriverOptions;
use dccwave_core::timing::SignalTiming;

use crate::args::PacketArgs;

#[derive(clap::Args, Debug)]
pub struct EventsCommand {
    #[clap(flatten)]
    packet: PacketArgs,
    /// Bracket the packet with the debug GPIO markers
    #[clap(long)]
    debug: bool,
}

pub fn handle_events(command: EventsCommand, options: &DriverOptions) -> anyhow::Result<()> {
    let packet = command.packet.to_packet()?;
    let timing = SignalTiming::new(options.pulse_width)?;

    let mut bitstream = Bitstream::new(timing);
    bitstream.append_operations_mode_packet(&packet, command.debug)?;

    for (index, event) in bitstream.events().iter().enumerate() {
        match event {
            BitstreamEvent::Data { word, size } => {
                println!("{index:4}  Data {word:#010X} ({size} bits)");
            }
            other => println!("{index:4}  {other:?}"),
        }
    }
    println!(
        "{} events, one playback takes {:.1}µs",
        bitstream.events().len(),
        bitstream.duration_us()
    );

    Ok(())
}
