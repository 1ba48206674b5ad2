use std::path::PathBuf;

use anyhow::bail;
use clap::Subcommand;
use dccwave_core::dcc::{Address, Direction, Instruction, Packet};

#[derive(clap::Parser, Debug)]
#[clap(version, about)]
pub struct Args {
    /// Increase log verbosity; may be repeated.
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Driver options file (JSON); defaults apply when omitted.
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,
    #[clap(subcommand)]
    pub commands: SubCommands,
}

#[derive(Subcommand, Debug)]
pub enum SubCommands {
    /// Encode a packet and print its bytes
    #[clap(alias = "p")]
    Packet(crate::commands::packet::PacketCommand),
    /// Dump the bitstream events a packet expands to
    #[clap(alias = "e")]
    Events(crate::commands::events::EventsCommand),
    /// Compile a packet and dump the control-block program
    #[clap(alias = "b")]
    Blocks(crate::commands::blocks::BlocksCommand),
    /// Transmit packets against the simulated hardware
    #[clap(alias = "r")]
    Run(crate::commands::run::RunCommand),
    /// Show the pulse counts derived from the pulse width
    #[clap(alias = "t")]
    Timing(crate::commands::timing::TimingCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AddressKind {
    Broadcast,
    Primary,
    Extended,
    Accessory,
    Signal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DirectionArg {
    Forward,
    Reverse,
}

impl From<DirectionArg> for Direction {
    fn from(direction: DirectionArg) -> Self {
        match direction {
            DirectionArg::Forward => Direction::Forward,
            DirectionArg::Reverse => Direction::Reverse,
        }
    }
}

/// The packet selection flags shared by every subcommand.
#[derive(clap::Args, Debug)]
pub struct PacketArgs {
    /// Decoder address; omit for a broadcast
    #[clap(long)]
    pub address: Option<u16>,
    /// Address partition the address belongs to
    #[clap(long, value_enum, default_value_t = AddressKind::Primary)]
    pub kind: AddressKind,
    /// Speed step to send, 28-step encoding (0 stops)
    #[clap(long, conflicts_with = "estop")]
    pub speed: Option<u8>,
    #[clap(long, value_enum, default_value_t = DirectionArg::Forward)]
    pub direction: DirectionArg,
    /// Send an emergency stop instead of a speed step
    #[clap(long)]
    pub estop: bool,
    /// Function group F0-F4 state, F0 in bit 0
    #[clap(long)]
    pub functions: Option<u8>,
    /// Write a configuration variable, e.g. --cv 17=42
    #[clap(long, value_parser = parse_cv)]
    pub cv: Option<(u16, u8)>,
}

impl PacketArgs {
    pub fn to_packet(&self) -> anyhow::Result<Packet> {
        let address = match (self.kind, self.address) {
            (AddressKind::Broadcast, None) => Address::Broadcast,
            (AddressKind::Broadcast, Some(_)) => bail!("a broadcast takes no --address"),
            (AddressKind::Primary, Some(address)) => Address::Primary(address),
            (AddressKind::Extended, Some(address)) => Address::Extended(address),
            (AddressKind::Accessory, Some(address)) => Address::Accessory(address),
            (AddressKind::Signal, Some(address)) => Address::Signal(address),
            (_, None) => bail!("--address is required for {:?} addresses", self.kind),
        };

        let mut instructions = Vec::new();
        if self.estop {
            instructions.push(Instruction::EmergencyStop28 {
                direction: self.direction.into(),
            });
        } else if let Some(speed) = self.speed {
            instructions.push(Instruction::Speed28 {
                speed,
                direction: self.direction.into(),
            });
        }
        if let Some(functions) = self.functions {
            instructions.push(Instruction::FunctionGroup1 { functions });
        }
        if let Some((cv, value)) = self.cv {
            instructions.push(Instruction::CvWrite { cv, value });
        }

        if instructions.is_empty() {
            bail!("nothing to send; pass --speed, --estop, --functions or --cv");
        }

        Ok(Packet::new(address, instructions))
    }
}

fn parse_cv(input: &str) -> Result<(u16, u8), String> {
    let (cv, value) = input
        .split_once('=')
        .ok_or_else(|| format!("expected NUMBER=VALUE, got `{input}`"))?;

    Ok((
        cv.parse().map_err(|_| format!("invalid CV number `{cv}`"))?,
        value.parse().map_err(|_| format!("invalid CV value `{value}`"))?,
    ))
}
