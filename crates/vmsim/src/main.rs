mod console;
mod script;
mod simulator;

use std::{fs, path::PathBuf};

use clap::{Parser, Subcommand};

use console::Console;
use simulator::{MIN_FRAMES, Simulator};

/// Script run by `vmsim demo`.
const DEMO_SCRIPT: &str = include_str!("../scripts/demo.vms");

#[derive(Parser)]
#[command(name = "vmsim")]
#[command(about = "Replays process lifecycle scripts against the Polaris virtual memory manager")]
struct Args {
    /// Increase logging verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a script file
    Run {
        /// Script to replay
        script: PathBuf,

        /// Frames of usable physical memory
        #[arg(short, long, default_value_t = 256, value_parser = parse_frames)]
        frames: usize,

        /// Seed for the TLB's random replacement
        #[arg(short, long, default_value_t = 1)]
        seed: u32,
    },
    /// Run the built-in demonstration script
    Demo {
        /// Frames of usable physical memory
        #[arg(short, long, default_value_t = 64, value_parser = parse_frames)]
        frames: usize,
    },
}

fn parse_frames(value: &str) -> Result<usize, String> {
    const MAX_FRAMES: usize = 16 * 1024;
    let frames: usize = value.parse().map_err(|_| format!("`{}` is not a number", value))?;
    if !(MIN_FRAMES..=MAX_FRAMES).contains(&frames) {
        return Err(format!("frames must be between {} and {}", MIN_FRAMES, MAX_FRAMES));
    }
    Ok(frames)
}

fn run(source: &str, frames: usize, seed: u32) -> Result<(), Box<dyn std::error::Error>> {
    let lines = script::parse(source)?;
    let mut simulator = Simulator::new(frames, seed);
    simulator.run(&lines, |event| println!("{}", event))?;

    for (name, space) in simulator.processes() {
        log::info!(
            "{} still running with {} resident page(s){}",
            name,
            simulator.vm().resident_pages(space),
            if simulator.current() == Some(name) { " (current)" } else { "" }
        );
    }
    Ok(())
}

/// Installs the console logger. `SetLoggerError` is only a `std` error when `log` has
/// its `std` feature, so it is carried as a message.
fn install_console(verbosity: u8) -> Result<(), Box<dyn std::error::Error>> {
    Console::init(console::level_for(verbosity)).map_err(|err| err.to_string())?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    install_console(args.verbose)?;

    match args.command {
        Command::Run {
            script,
            frames,
            seed,
        } => run(&fs::read_to_string(script)?, frames, seed),
        Command::Demo { frames } => run(DEMO_SCRIPT, frames, 1),
    }
}
