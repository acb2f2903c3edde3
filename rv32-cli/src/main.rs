use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::error;

use rv32_core::hart::Tick;
use rv32_core::simulator::Simulator;

mod debug;

/// A 32-bit RISC-V (RV32IMA_Zicsr_Zifencei) instruction-set simulator.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Memory images to load, in order. Bare filenames (no directory component) are resolved
    /// relative to the current directory.
    images: Vec<String>,

    /// Listen on this TCP port for a GDB remote-serial connection instead of running freely.
    #[arg(long)]
    gdb: Option<u16>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut simulator = match Simulator::new(&root, &args.images) {
        Ok(simulator) => simulator,
        Err(err) => {
            error!("failed to construct simulator: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(port) = args.gdb {
        return match debug::run_debug_server(simulator, port) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!("gdb server error: {err}");
                ExitCode::FAILURE
            }
        };
    }

    loop {
        if simulator.tick() == Tick::Exited {
            return ExitCode::SUCCESS;
        }
    }
}
