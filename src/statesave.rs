// State-save file format (spec.md §6, out of scope as a feature but named
// in the CLI surface's `--save-state`; carried as an ambient concern per
// SPEC_FULL.md §A, the same way em68k persists nothing but structures its
// `dump()` output as named register fields). Format: a sequence of 24-byte
// chunk headers `(name[8], length, data)`; memory chunks are followed by
// 2 MiB of raw memory rather than embedding the data inline in the header.

use crate::cpu::Cpu;
use crate::error::EmulatorError;
use std::io::Write;
use std::path::Path;

const CHUNK_NAME_LEN: usize = 8;
const MEM_CHUNK_SIZE: usize = 2 * 1024 * 1024;

struct ChunkWriter<W: Write> {
    out: W,
}

impl<W: Write> ChunkWriter<W> {
    fn new(out: W) -> Self {
        ChunkWriter { out }
    }

    /// Writes a 24-byte header `(name[8], length:u64, reserved:u64)`
    /// followed immediately by `data`. Headers are a fixed 24 bytes
    /// regardless of payload length (spec.md §6).
    fn write_chunk(&mut self, name: &str, data: &[u8]) -> std::io::Result<()> {
        let mut name_bytes = [0u8; CHUNK_NAME_LEN];
        let bytes = name.as_bytes();
        let n = bytes.len().min(CHUNK_NAME_LEN);
        name_bytes[..n].copy_from_slice(&bytes[..n]);
        self.out.write_all(&name_bytes)?;
        self.out.write_all(&(data.len() as u64).to_be_bytes())?;
        self.out.write_all(&0u64.to_be_bytes())?; // reserved, pads header to 24 bytes
        self.out.write_all(data)
    }

    fn write_reg32(&mut self, name: &str, value: u32) -> std::io::Result<()> {
        self.write_chunk(name, &value.to_be_bytes())
    }
}

/// Writes CPU architectural state plus a `MEMBLK` chunk per 2 MiB of RAM
/// to `path` (spec.md §6: `PC`, `LR`, `GPR00..31`, `SR00..15`,
/// `IBAT0U..DBAT3L`, etc., and `MEMBLK` for RAM).
pub fn save_state(path: &Path, cpu: &Cpu, ram: &[u8]) -> Result<(), EmulatorError> {
    let file = std::fs::File::create(path)
        .map_err(|source| EmulatorError::StateSave { path: path.display().to_string(), source })?;
    write_state(file, cpu, ram).map_err(|source| EmulatorError::StateSave { path: path.display().to_string(), source })
}

fn write_state<W: Write>(out: W, cpu: &Cpu, ram: &[u8]) -> std::io::Result<()> {
    let mut w = ChunkWriter::new(out);
    w.write_reg32("PC", cpu.pc)?;
    w.write_reg32("LR", cpu.lr)?;
    w.write_reg32("CTR", cpu.ctr)?;
    w.write_reg32("XER", cpu.xer)?;
    w.write_reg32("CR", cpu.cr)?;
    w.write_reg32("MSR", cpu.msr)?;
    w.write_reg32("SRR0", cpu.srr0)?;
    w.write_reg32("SRR1", cpu.srr1)?;
    w.write_reg32("DAR", cpu.dar)?;
    w.write_reg32("DSISR", cpu.dsisr)?;
    w.write_reg32("DEC", cpu.dec)?;
    w.write_reg32("SDR1", cpu.sdr1)?;
    for (i, gpr) in cpu.gpr.iter().enumerate() {
        w.write_reg32(&format!("GPR{i:02}"), *gpr)?;
    }
    for (i, sr) in cpu.sr.iter().enumerate() {
        w.write_reg32(&format!("SR{i:02}"), *sr)?;
    }
    for i in 0..8 {
        w.write_reg32(&format!("IBAT{i}U"), cpu.ibatu[i])?;
        w.write_reg32(&format!("IBAT{i}L"), cpu.ibatl[i])?;
        w.write_reg32(&format!("DBAT{i}U"), cpu.dbatu[i])?;
        w.write_reg32(&format!("DBAT{i}L"), cpu.dbatl[i])?;
    }
    for block in ram.chunks(MEM_CHUNK_SIZE) {
        let mut padded = block.to_vec();
        padded.resize(MEM_CHUNK_SIZE, 0);
        w.write_chunk("MEMBLK", &padded)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_well_formed_chunks() {
        let cpu = Cpu::new();
        let ram = vec![0u8; 16];
        let mut buf = Vec::new();
        write_state(&mut buf, &cpu, &ram).unwrap();
        assert_eq!(&buf[0..2], b"PC");
        let length = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        assert_eq!(length, 4);
        assert_eq!(&buf[24..28], &0u32.to_be_bytes());
    }
}
