use tabled::{Style, Table};

use dccwave_core::bitstream::Bitstream;
use dccwave_core::driver::{DriverOptions, QueuedBitstream};
use dccwave_core::hardware::PERIPHERAL_BUS_BASE;
use dccwave_core::timing::SignalTiming;

use crate::args::PacketArgs;
use crate::format::{classify_block, BlockRow};

#[derive(clap::Args, Debug)]
pub struct BlocksCommand {
    #[clap(flatten)]
    packet: PacketArgs,
    /// Bracket the packet with the debug GPIO markers
    #[clap(long)]
    debug: bool,
}

pub fn handle_blocks(command: BlocksCommand, options: &DriverOptions) -> anyhow::Result<()> {
    let packet = command.packet.to_packet()?;
    let timing = SignalTiming::new(options.pulse_width)?;

    let mut bitstream = Bitstream::new(timing);
    bitstream.append_operations_mode_packet(&packet, command.debug)?;

    let mut queued = QueuedBitstream::new(PERIPHERAL_BUS_BASE, options);
    queued.parse(&bitstream)?;

    let rows: Vec<BlockRow> = queued
        .control_blocks()
        .iter()
        .enumerate()
        .map(|(index, block)| BlockRow {
            index,
            kind: classify_block(&queued, block),
            block: *block,
        })
        .collect();

    println!(
        "{} control blocks, {} data words, {} breakpoints",
        queued.control_blocks().len(),
        queued.data().len(),
        queued.breakpoints().len()
    );
    println!("{}", Table::new(rows).with(Style::PSEUDO_CLEAN));
    Ok(())
}
