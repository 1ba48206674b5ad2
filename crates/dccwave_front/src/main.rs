use args::{Args, SubCommands};
use clap::Parser;
use commands::{blocks, events, packet, run, timing};
use log::LevelFilter;

mod args;
mod commands;
mod config;
mod format;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let cfg = simplelog::ConfigBuilder::new().build();
    simplelog::SimpleLogger::init(level, cfg)?;

    let options = config::load_driver_options(args.config.as_deref())?;

    match args.commands {
        SubCommands::Packet(cmd) => packet::handle_packet(cmd),
        SubCommands::Events(cmd) => events::handle_events(cmd, &options),
        SubCommands::Blocks(cmd) => blocks::handle_blocks(cmd, &options),
        SubCommands::Run(cmd) => run::handle_run(cmd, options),
        SubCommands::Timing(cmd) => timing::handle_timing(cmd, &options),
    }
}
