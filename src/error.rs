//! Error taxonomy for the parts of the engine that can fail "fatally" (to the
//! whole process, not to a single instruction). Architectural faults that are
//! delivered as PowerPC exceptions are `Fault` (see `mmu.rs`), which is a
//! plain `Copy` enum consumed by control flow, not a `std::error::Error`.

use thiserror::Error;

/// Conditions the bus itself can raise. A miss is "fatal to the instruction's
/// fault path in practice" per spec (no bus-miss exception vector exists on
/// this core), so it propagates up to the runloop as a hard stop.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("unmapped physical address: {0:#010x}")]
    Unmapped(u32),
    #[error("device misuse at {addr:#010x}: {reason}")]
    DeviceMisuse { addr: u32, reason: &'static str },
}

/// Top-level errors that can terminate the emulator.
#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("failed to load ROM image {path}: {source}")]
    RomLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("failed to write state-save file {path}: {source}")]
    StateSave {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
}
