//! Configuration surface (spec.md §6 CLI, ambient per SPEC_FULL.md §A).
//! Parsing itself is an out-of-scope external collaborator, but the shape
//! of the surface is part of this crate: a `clap`-derive `Cli` mirrors the
//! option → effect table verbatim, and `Config` is the plain value the rest
//! of the crate consumes, following the separation em68k's own
//! `Configuration` struct draws between "what the user typed" and "what the
//! emulator core needs" (grounded in `NeilAllavarpu-Rasperry-Pi-OS/bootloader-server`'s
//! use of `clap::Parser` for a bare-metal loader's option surface).

use crate::runloop::Mode;
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceCategory {
    Syscall,
    Io,
    Branch,
    Mmu,
    Exception,
    Jit,
}

impl TraceCategory {
    /// The `log` target string each category maps onto, so `RUST_LOG`
    /// composes with `--trace` (SPEC_FULL.md §A).
    pub fn target(self) -> &'static str {
        match self {
            TraceCategory::Syscall => "mattrisc::syscall",
            TraceCategory::Io => "mattrisc::io",
            TraceCategory::Branch => "mattrisc::branch",
            TraceCategory::Mmu => "mattrisc::mmu",
            TraceCategory::Exception => "mattrisc::exception",
            TraceCategory::Jit => "mattrisc::jit",
        }
    }
}

impl std::str::FromStr for TraceCategory {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "syscall" => Ok(TraceCategory::Syscall),
            "io" => Ok(TraceCategory::Io),
            "branch" => Ok(TraceCategory::Branch),
            "mmu" => Ok(TraceCategory::Mmu),
            "exception" => Ok(TraceCategory::Exception),
            "jit" => Ok(TraceCategory::Jit),
            other => Err(format!("unknown trace category: {other}")),
        }
    }
}

/// Command-line surface (spec.md §6). `clap` derives parsing/help for free;
/// this struct is the external-collaborator interface boundary, not an
/// in-scope feature.
#[derive(Parser, Debug)]
#[command(name = "mattrisc", about = "A 32-bit PowerPC-family instruction-set simulator")]
pub struct Cli {
    /// ROM/image file loaded into RAM at `load_addr`.
    #[arg(long = "rom-path")]
    pub rom_path: Option<PathBuf>,

    #[arg(long = "load-addr", default_value_t = 0)]
    pub load_addr: u32,

    /// Initial PC; defaults to `load_addr` if unset.
    #[arg(long = "start-addr")]
    pub start_addr: Option<u32>,

    #[arg(long = "start-msr", default_value_t = 0)]
    pub start_msr: u32,

    #[arg(long = "instr-limit")]
    pub instr_limit: Option<u64>,

    #[arg(long = "dump-state-period")]
    pub dump_state_period: Option<u64>,

    /// Raw-image block device; repeatable, up to the platform's device
    /// count (spec.md §6).
    #[arg(long = "block-path")]
    pub block_path: Vec<PathBuf>,

    /// Static GPIO input word (Platform 3 only).
    #[arg(long = "gpio-inputs", default_value_t = 0)]
    pub gpio_inputs: u32,

    #[arg(long = "trace", value_parser = clap::value_parser!(TraceCategory))]
    pub trace: Vec<TraceCategory>,

    #[arg(long = "save-state")]
    pub save_state: Option<PathBuf>,

    #[arg(long = "block-mode")]
    pub block_mode: bool,

    #[arg(short, long)]
    pub verbose: bool,

    #[arg(long)]
    pub disass: bool,
}

impl clap::ValueEnum for TraceCategory {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            TraceCategory::Syscall,
            TraceCategory::Io,
            TraceCategory::Branch,
            TraceCategory::Mmu,
            TraceCategory::Exception,
            TraceCategory::Jit,
        ]
    }
    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(match self {
            TraceCategory::Syscall => "syscall",
            TraceCategory::Io => "io",
            TraceCategory::Branch => "branch",
            TraceCategory::Mmu => "mmu",
            TraceCategory::Exception => "exception",
            TraceCategory::Jit => "jit",
        }))
    }
}

/// The value the runloop and platform glue actually consume, derived from
/// `Cli` (mirrors em68k's `Configuration`).
#[derive(Debug, Clone)]
pub struct Config {
    pub rom_path: Option<PathBuf>,
    pub load_addr: u32,
    pub start_addr: u32,
    pub start_msr: u32,
    pub instr_limit: Option<u64>,
    pub dump_state_period: Option<u64>,
    pub block_paths: Vec<PathBuf>,
    pub gpio_inputs: u32,
    pub trace: Vec<TraceCategory>,
    pub save_state: Option<PathBuf>,
    pub mode: Mode,
    pub verbose: bool,
    pub disass: bool,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        let load_addr = cli.load_addr;
        Config {
            rom_path: cli.rom_path,
            load_addr,
            start_addr: cli.start_addr.unwrap_or(load_addr),
            start_msr: cli.start_msr,
            instr_limit: cli.instr_limit,
            dump_state_period: cli.dump_state_period,
            block_paths: cli.block_path,
            gpio_inputs: cli.gpio_inputs,
            trace: cli.trace,
            save_state: cli.save_state,
            mode: if cli.block_mode { Mode::Block } else { Mode::Interpreter },
            verbose: cli.verbose,
            disass: cli.disass,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_addr_defaults_to_load_addr() {
        let cli = Cli {
            rom_path: None,
            load_addr: 0x1000,
            start_addr: None,
            start_msr: 0,
            instr_limit: None,
            dump_state_period: None,
            block_path: vec![],
            gpio_inputs: 0,
            trace: vec![],
            save_state: None,
            block_mode: false,
            verbose: false,
            disass: false,
        };
        let cfg: Config = cli.into();
        assert_eq!(cfg.start_addr, 0x1000);
        assert_eq!(cfg.mode, Mode::Interpreter);
    }
}
