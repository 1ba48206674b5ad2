use owo_colors::OwoColorize;

use dccwave_core::packer::{BitPacker, PacketPacker};

use crate::args::PacketArgs;
use crate::format::hex_bytes;

#[derive(clap::Args, Debug)]
pub struct PacketCommand {
    #[clap(flatten)]
    packet: PacketArgs,
    /// Also print the framed bit sequence (separators, check byte, end bit)
    #[clap(long)]
    bits: bool,
}

pub fn handle_packet(command: PacketCommand) -> anyhow::Result<()> {
    let packet = command.packet.to_packet()?;
    let bytes = packet.pack_bytes()?;

    println!("{} {}", "Packet".bright_green(), hex_bytes(&bytes));

    if command.bits {
        let mut packer = PacketPacker::new(BitPacker::new(1));
        packet.pack_fields(&mut packer)?;
        let bits: String = packer
            .finish()?
            .into_words()
            .into_iter()
            .map(|bit| if bit != 0 { '1' } else { '0' })
            .collect();
        println!("{}   {bits}", "Bits".bright_green());
    }

    Ok(())
}
