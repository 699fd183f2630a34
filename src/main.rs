//! Lyra CLI - load a guest image and run it under the JIT.

// Allow print in the CLI binary
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use lyra::{Counters, Emulator};

/// Lyra - an `AArch64` binary translator
#[derive(Parser, Debug)]
#[command(name = "lyra")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Guest image: an `AArch64` ELF executable or a flat binary
    input: PathBuf,

    /// Override the entry point
    #[arg(short, long)]
    entry: Option<u64>,

    /// Treat guest data accesses as big-endian
    #[arg(long)]
    big_endian: bool,

    /// Dump the register file after every executed block
    #[arg(short, long)]
    debug: bool,

    /// Print execution counters as JSON after the guest halts
    #[arg(short, long)]
    profile: bool,

    /// Write the profile JSON to a file instead of stdout
    #[arg(short, long, requires = "profile")]
    output: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut emu = Emulator::new()?;
    emu.space_mut().set_big_endian(args.big_endian);

    emu.load(&args.input)?;
    if let Some(entry) = args.entry {
        emu.regs_mut().set_pc(entry);
    }

    let mut counters = Counters::default();
    if args.debug {
        while emu.regs().pc() != 0 {
            emu.step(&mut counters)?;
            println!("{}\n", emu.regs());
        }
    } else {
        emu.run(&mut counters)?;
    }

    if args.profile {
        let report = serde_json::to_string_pretty(&counters)?;
        match &args.output {
            Some(path) => fs::write(path, report)?,
            None => println!("{report}"),
        }
    }

    Ok(())
}
