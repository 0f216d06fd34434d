// Interpreter: per-instruction semantics (spec.md §4.5). Grounded on
// em68k's `instructions.rs` for the shape of a semantic function (operate
// on `&mut Cpu`/`&mut Bus`-equivalents, update flags, advance PC), adapted
// to this core's MMU-mediated memory access and Result-based fault
// propagation (spec.md §9 REDESIGN FLAGS: longjmp escape modelled as
// `Result<(), Exception>`-shaped control flow rather than an actual
// non-local jump).
//
// Every memory-touching routine follows the same shape as the origin's
// "check macro after every helper": call the MMU, and on `MmuError::Fault`
// raise the matching architectural exception and stop the instruction;
// on `MmuError::Bus` propagate as a fatal error up through the runloop.

use crate::bus::Bus;
use crate::cpu::{Cpu, ProgReason, MSR_EE};
use crate::decode::{self, Instruction};
use crate::error::BusError;
use crate::mmu::{Fault, Mmu, MmuError};
use log::trace;

const XER_SO: u32 = 0x8000_0000;
const XER_OV: u32 = 0x4000_0000;
const XER_CA: u32 = 0x2000_0000;

const SPR_XER: u16 = 1;
const SPR_LR: u16 = 8;
const SPR_CTR: u16 = 9;
const SPR_DSISR: u16 = 18;
const SPR_DAR: u16 = 19;
const SPR_DEC: u16 = 22;
const SPR_SDR1: u16 = 25;
const SPR_SRR0: u16 = 26;
const SPR_SRR1: u16 = 27;
const SPR_SPRG0: u16 = 272;
const SPR_SPRG3: u16 = 275;
const SPR_IBAT_BASE: u16 = 528;
const SPR_DBAT_BASE: u16 = 536;
const SPR_HID0: u16 = 1008;
const SPR_HID1: u16 = 1009;
const SPR_PIR: u16 = 1023;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecResult {
    /// Instruction completed; the runloop should keep going.
    Normal,
    /// A fault was raised and delivered as an exception; PC already points
    /// at the vector. The caller (runloop or block) must stop executing
    /// this stream and re-fetch.
    Aborted,
    /// "Branch to self with no pending work" while `MSR.EE` is clear
    /// (spec.md §8 boundary behaviour) — a clean simulation stop, not a
    /// fault.
    Halted,
}

/// Fetches, decodes and executes exactly one instruction. Mirrors the
/// interpreter-mode runloop pseudocode's `interp.execute()` call.
pub fn execute(cpu: &mut Cpu, mmu: &mut Mmu, bus: &mut Bus) -> Result<ExecResult, BusError> {
    let priv_mode = cpu.privileged();
    let fetch = mmu.load_inst32(bus, cpu.pc, priv_mode);
    // Fetch addresses are PC, always word-aligned, so the fetch path never
    // takes the Align branch of `raise_mem_exception` — the placeholder 0
    // is never read as an opcode.
    let word = match mem_outcome(cpu, mmu, true, true, cpu.pc, 0, fetch)? {
        Outcome::Value(w) => w,
        Outcome::Aborted => return Ok(ExecResult::Aborted),
    };
    let instr = decode::decode(word);
    trace!(target: "mattrisc::branch", "pc={:#010x} word={word:#010x}", cpu.pc);
    run(cpu, mmu, bus, word, instr)
}

enum Outcome<T> {
    Value(T),
    Aborted,
}

fn mem_outcome<T>(
    cpu: &mut Cpu,
    mmu: &mut Mmu,
    rnw: bool,
    ind: bool,
    addr: u32,
    instruction: u32,
    r: Result<T, MmuError>,
) -> Result<Outcome<T>, BusError> {
    match r {
        Ok(v) => Ok(Outcome::Value(v)),
        Err(MmuError::Fault(f)) => {
            cpu.raise_mem_exception(mmu, rnw, ind, addr, f, instruction);
            Ok(Outcome::Aborted)
        }
        Err(MmuError::Bus(e)) => Err(e),
    }
}

fn gpr(cpu: &Cpu, r: u8) -> u32 {
    if r == 0 {
        0
    } else {
        cpu.gpr[r as usize]
    }
}
fn gpr_ra0(cpu: &Cpu, r: u8) -> u32 {
    // rA in D-form/X-form memory EAs is literal (no r0-as-zero rule
    // exception) except that r0 in the base register position means "no
    // base", i.e. contributes 0 — which is exactly `gpr`'s r0 handling.
    gpr(cpu, r)
}
fn set_gpr(cpu: &mut Cpu, r: u8, v: u32) {
    if r != 0 {
        cpu.gpr[r as usize] = v;
    }
}

fn cr_bit(cpu: &Cpu, bi: u8) -> bool {
    (cpu.cr >> (31 - bi as u32)) & 1 != 0
}
fn set_crf(cpu: &mut Cpu, crf: u8, value: u8) {
    let shift = 28 - (crf as u32) * 4;
    cpu.cr = (cpu.cr & !(0xf << shift)) | ((value as u32 & 0xf) << shift);
}
fn set_cr0(cpu: &mut Cpu, result: i32) {
    let so = cpu.xer & XER_SO != 0;
    let mut v = 0u8;
    if result < 0 {
        v |= 0b1000;
    } else if result > 0 {
        v |= 0b0100;
    } else {
        v |= 0b0010;
    }
    if so {
        v |= 0b0001;
    }
    set_crf(cpu, 0, v);
}
fn cmp_signed(cpu: &mut Cpu, crf: u8, a: i32, b: i32) {
    let mut v = 0u8;
    if a < b {
        v |= 0b1000;
    } else if a > b {
        v |= 0b0100;
    } else {
        v |= 0b0010;
    }
    if cpu.xer & XER_SO != 0 {
        v |= 0b0001;
    }
    set_crf(cpu, crf, v);
}
fn cmp_unsigned(cpu: &mut Cpu, crf: u8, a: u32, b: u32) {
    let mut v = 0u8;
    if a < b {
        v |= 0b1000;
    } else if a > b {
        v |= 0b0100;
    } else {
        v |= 0b0010;
    }
    if cpu.xer & XER_SO != 0 {
        v |= 0b0001;
    }
    set_crf(cpu, crf, v);
}

fn add_with_carry_in(a: u32, b: u32, carry_in: u32) -> (u32, bool, bool) {
    let sum = (a as u64) + (b as u64) + (carry_in as u64);
    let result = sum as u32;
    let carry = sum > 0xFFFF_FFFF;
    let overflow = (!(a ^ b) & (a ^ result)) & 0x8000_0000 != 0;
    (result, carry, overflow)
}

fn set_xer_ov(cpu: &mut Cpu, oe: bool, overflow: bool) {
    if !oe {
        return;
    }
    if overflow {
        cpu.xer |= XER_OV | XER_SO;
    } else {
        cpu.xer &= !XER_OV;
    }
}

/// `mkmask(MB, ME)` (spec.md §4.5): the standard PowerPC rotate mask, which
/// wraps when `MB > ME`.
pub fn mkmask(mb: u8, me: u8) -> u32 {
    let mb = mb as u32;
    let me = me as u32;
    let ones_from_mb = !0u32 >> mb;
    let ones_through_me = if me == 31 { !0u32 } else { !(!0u32 >> (me + 1)) };
    if mb <= me {
        ones_from_mb & ones_through_me
    } else {
        ones_from_mb | ones_through_me
    }
}

fn sign_extend16(v: u16) -> i32 {
    v as i16 as i32
}

fn spr_privileged(spr: u16) -> bool {
    !matches!(spr, SPR_XER | SPR_LR | SPR_CTR)
}

fn bo_taken(cpu: &mut Cpu, bo: u8, bi: u8) -> bool {
    let ignore_ctr = bo & 0b10000 != 0;
    let ctr_want_zero = bo & 0b01000 != 0;
    let ignore_cond = bo & 0b00100 != 0;
    let cond_want = bo & 0b00010 != 0;
    let ctr_ok = if ignore_ctr {
        true
    } else {
        cpu.ctr = cpu.ctr.wrapping_sub(1);
        let nz = cpu.ctr != 0;
        if ctr_want_zero {
            !nz
        } else {
            nz
        }
    };
    let cond_ok = ignore_cond || cr_bit(cpu, bi) == cond_want;
    ctr_ok && cond_ok
}

fn bat_index(spr: u16, base: u16) -> (usize, bool) {
    let off = spr - base;
    ((off / 2) as usize, off % 2 == 0)
}

/// Executes one already-decoded instruction without fetching. The block
/// cache's "threaded" blocks call straight into this, skipping the
/// fetch+decode `execute` does, since a block already holds the decoded
/// sequence (spec.md §4.6).
pub(crate) fn run(
    cpu: &mut Cpu,
    mmu: &mut Mmu,
    bus: &mut Bus,
    word: u32,
    instr: Instruction,
) -> Result<ExecResult, BusError> {
    use Instruction::*;
    let priv_mode = cpu.privileged();
    match instr {
        Lwz { rd, ra, d } => {
            let addr = gpr_ra0(cpu, ra).wrapping_add(sign_extend16(d as u16) as u32);
            let r = mmu.load32(bus, addr, priv_mode);
            match mem_outcome(cpu, mmu, true, false, addr, word, r)? {
                Outcome::Value(v) => {
                    set_gpr(cpu, rd, v);
                    cpu.pc += 4;
                }
                Outcome::Aborted => return Ok(ExecResult::Aborted),
            }
        }
        Lhz { rd, ra, d } => {
            let addr = gpr_ra0(cpu, ra).wrapping_add(sign_extend16(d as u16) as u32);
            let r = mmu.load16(bus, addr, priv_mode);
            match mem_outcome(cpu, mmu, true, false, addr, word, r)? {
                Outcome::Value(v) => {
                    set_gpr(cpu, rd, v as u32);
                    cpu.pc += 4;
                }
                Outcome::Aborted => return Ok(ExecResult::Aborted),
            }
        }
        Lbz { rd, ra, d } => {
            let addr = gpr_ra0(cpu, ra).wrapping_add(sign_extend16(d as u16) as u32);
            let r = mmu.load8(bus, addr, priv_mode);
            match mem_outcome(cpu, mmu, true, false, addr, word, r)? {
                Outcome::Value(v) => {
                    set_gpr(cpu, rd, v as u32);
                    cpu.pc += 4;
                }
                Outcome::Aborted => return Ok(ExecResult::Aborted),
            }
        }
        Stw { rs, ra, d } => {
            let addr = gpr_ra0(cpu, ra).wrapping_add(sign_extend16(d as u16) as u32);
            let r = mmu.store32(bus, addr, priv_mode, gpr(cpu, rs));
            match mem_outcome(cpu, mmu, false, false, addr, word, r)? {
                Outcome::Value(()) => cpu.pc += 4,
                Outcome::Aborted => return Ok(ExecResult::Aborted),
            }
        }
        Sth { rs, ra, d } => {
            let addr = gpr_ra0(cpu, ra).wrapping_add(sign_extend16(d as u16) as u32);
            let r = mmu.store16(bus, addr, priv_mode, gpr(cpu, rs) as u16);
            match mem_outcome(cpu, mmu, false, false, addr, word, r)? {
                Outcome::Value(()) => cpu.pc += 4,
                Outcome::Aborted => return Ok(ExecResult::Aborted),
            }
        }
        Stb { rs, ra, d } => {
            let addr = gpr_ra0(cpu, ra).wrapping_add(sign_extend16(d as u16) as u32);
            let r = mmu.store8(bus, addr, priv_mode, gpr(cpu, rs) as u8);
            match mem_outcome(cpu, mmu, false, false, addr, word, r)? {
                Outcome::Value(()) => cpu.pc += 4,
                Outcome::Aborted => return Ok(ExecResult::Aborted),
            }
        }
        Lwarx { rd, ra, rb } => {
            let addr = gpr_ra0(cpu, ra).wrapping_add(gpr(cpu, rb));
            let r = mmu.load32(bus, addr, priv_mode);
            match mem_outcome(cpu, mmu, true, false, addr, word, r)? {
                Outcome::Value(v) => {
                    // Reservation tracks the effective address (spec.md §3),
                    // not the translated physical address.
                    cpu.reservation = Some((addr, mmu.generation));
                    set_gpr(cpu, rd, v);
                    cpu.pc += 4;
                }
                Outcome::Aborted => return Ok(ExecResult::Aborted),
            }
        }
        Stwcx { rs, ra, rb } => {
            let addr = gpr_ra0(cpu, ra).wrapping_add(gpr(cpu, rb));
            let success = matches!(cpu.reservation, Some((a, g)) if a == addr && g == mmu.generation);
            if success {
                let r = mmu.store32(bus, addr, priv_mode, gpr(cpu, rs));
                match mem_outcome(cpu, mmu, false, false, addr, word, r)? {
                    Outcome::Value(()) => {}
                    Outcome::Aborted => return Ok(ExecResult::Aborted),
                }
            }
            set_crf(cpu, 0, if success { 0b0010 } else { 0b0000 } | if cpu.xer & XER_SO != 0 { 1 } else { 0 });
            cpu.reservation = None;
            mmu.bump_generation();
            cpu.pc += 4;
        }
        Lmw { rd, ra, d } => {
            let mut addr = gpr_ra0(cpu, ra).wrapping_add(sign_extend16(d as u16) as u32);
            for reg in rd..32 {
                let r = mmu.load32(bus, addr, priv_mode);
                match mem_outcome(cpu, mmu, true, false, addr, word, r)? {
                    Outcome::Value(v) => set_gpr(cpu, reg, v),
                    Outcome::Aborted => return Ok(ExecResult::Aborted),
                }
                addr = addr.wrapping_add(4);
            }
            cpu.pc += 4;
        }
        Stmw { rs, ra, d } => {
            let mut addr = gpr_ra0(cpu, ra).wrapping_add(sign_extend16(d as u16) as u32);
            for reg in rs..32 {
                let r = mmu.store32(bus, addr, priv_mode, gpr(cpu, reg));
                match mem_outcome(cpu, mmu, false, false, addr, word, r)? {
                    Outcome::Value(()) => {}
                    Outcome::Aborted => return Ok(ExecResult::Aborted),
                }
                addr = addr.wrapping_add(4);
            }
            cpu.pc += 4;
        }

        Addi { rd, ra, simm } => {
            let base = if ra == 0 { 0 } else { gpr(cpu, ra) };
            set_gpr(cpu, rd, base.wrapping_add(simm as i32 as u32));
            cpu.pc += 4;
        }
        Addis { rd, ra, simm } => {
            let base = if ra == 0 { 0 } else { gpr(cpu, ra) };
            set_gpr(cpu, rd, base.wrapping_add((simm as i32 as u32) << 16));
            cpu.pc += 4;
        }
        Subfic { rd, ra, simm } => {
            let (result, carry, _) = add_with_carry_in(!gpr(cpu, ra), simm as i32 as u32, 1);
            set_gpr(cpu, rd, result);
            if carry {
                cpu.xer |= XER_CA;
            } else {
                cpu.xer &= !XER_CA;
            }
            cpu.pc += 4;
        }
        AddReg { rd, ra, rb, oe, rc } => {
            let (result, _, overflow) = add_with_carry_in(gpr(cpu, ra), gpr(cpu, rb), 0);
            set_gpr(cpu, rd, result);
            set_xer_ov(cpu, oe, overflow);
            if rc {
                set_cr0(cpu, result as i32);
            }
            cpu.pc += 4;
        }
        SubfReg { rd, ra, rb, oe, rc } => {
            let (result, _, overflow) = add_with_carry_in(!gpr(cpu, ra), gpr(cpu, rb), 1);
            set_gpr(cpu, rd, result);
            set_xer_ov(cpu, oe, overflow);
            if rc {
                set_cr0(cpu, result as i32);
            }
            cpu.pc += 4;
        }
        DivwReg { rd, ra, rb, oe, rc, unsigned } => {
            let (result, overflow) = if unsigned {
                let a = gpr(cpu, ra);
                let b = gpr(cpu, rb);
                if b == 0 {
                    (0xFFFF_FFFFu32, true)
                } else {
                    (a / b, false)
                }
            } else {
                let a = gpr(cpu, ra) as i32;
                let b = gpr(cpu, rb) as i32;
                if b == 0 {
                    (if a >= 0 { 0x7FFF_FFFFu32 } else { 0x8000_0000u32 }, true)
                } else if a == i32::MIN && b == -1 {
                    (0x7FFF_FFFFu32, true)
                } else {
                    ((a / b) as u32, false)
                }
            };
            set_gpr(cpu, rd, result);
            set_xer_ov(cpu, oe, overflow);
            if rc {
                set_cr0(cpu, result as i32);
            }
            cpu.pc += 4;
        }
        MullwReg { rd, ra, rb, oe, rc } => {
            let a = gpr(cpu, ra) as i32 as i64;
            let b = gpr(cpu, rb) as i32 as i64;
            let product = a * b;
            let result = product as i32 as u32;
            let overflow = product != result as i32 as i64;
            set_gpr(cpu, rd, result);
            set_xer_ov(cpu, oe, overflow);
            if rc {
                set_cr0(cpu, result as i32);
            }
            cpu.pc += 4;
        }
        MulhwReg { rd, ra, rb, rc, unsigned } => {
            let result = if unsigned {
                (((gpr(cpu, ra) as u64) * (gpr(cpu, rb) as u64)) >> 32) as u32
            } else {
                (((gpr(cpu, ra) as i32 as i64) * (gpr(cpu, rb) as i32 as i64)) >> 32) as u32
            };
            set_gpr(cpu, rd, result);
            if rc {
                set_cr0(cpu, result as i32);
            }
            cpu.pc += 4;
        }
        Cntlzw { ra, rs, rc } => {
            let result = gpr(cpu, rs).leading_zeros();
            set_gpr(cpu, ra, result);
            if rc {
                set_cr0(cpu, result as i32);
            }
            cpu.pc += 4;
        }

        OriImm { ra, rs, uimm } => {
            set_gpr(cpu, ra, gpr(cpu, rs) | uimm as u32);
            cpu.pc += 4;
        }
        OrisImm { ra, rs, uimm } => {
            set_gpr(cpu, ra, gpr(cpu, rs) | ((uimm as u32) << 16));
            cpu.pc += 4;
        }
        XoriImm { ra, rs, uimm } => {
            set_gpr(cpu, ra, gpr(cpu, rs) ^ uimm as u32);
            cpu.pc += 4;
        }
        XorisImm { ra, rs, uimm } => {
            set_gpr(cpu, ra, gpr(cpu, rs) ^ ((uimm as u32) << 16));
            cpu.pc += 4;
        }
        AndiImm { ra, rs, uimm } => {
            let result = gpr(cpu, rs) & uimm as u32;
            set_gpr(cpu, ra, result);
            set_cr0(cpu, result as i32);
            cpu.pc += 4;
        }
        AndisImm { ra, rs, uimm } => {
            let result = gpr(cpu, rs) & ((uimm as u32) << 16);
            set_gpr(cpu, ra, result);
            set_cr0(cpu, result as i32);
            cpu.pc += 4;
        }
        AndReg { ra, rs, rb, rc } => {
            let result = gpr(cpu, rs) & gpr(cpu, rb);
            set_gpr(cpu, ra, result);
            if rc {
                set_cr0(cpu, result as i32);
            }
            cpu.pc += 4;
        }
        OrReg { ra, rs, rb, rc } => {
            let result = gpr(cpu, rs) | gpr(cpu, rb);
            set_gpr(cpu, ra, result);
            if rc {
                set_cr0(cpu, result as i32);
            }
            cpu.pc += 4;
        }
        XorReg { ra, rs, rb, rc } => {
            let result = gpr(cpu, rs) ^ gpr(cpu, rb);
            set_gpr(cpu, ra, result);
            if rc {
                set_cr0(cpu, result as i32);
            }
            cpu.pc += 4;
        }
        NandReg { ra, rs, rb, rc } => {
            let result = !(gpr(cpu, rs) & gpr(cpu, rb));
            set_gpr(cpu, ra, result);
            if rc {
                set_cr0(cpu, result as i32);
            }
            cpu.pc += 4;
        }
        NorReg { ra, rs, rb, rc } => {
            let result = !(gpr(cpu, rs) | gpr(cpu, rb));
            set_gpr(cpu, ra, result);
            if rc {
                set_cr0(cpu, result as i32);
            }
            cpu.pc += 4;
        }
        AndcReg { ra, rs, rb, rc } => {
            let result = gpr(cpu, rs) & !gpr(cpu, rb);
            set_gpr(cpu, ra, result);
            if rc {
                set_cr0(cpu, result as i32);
            }
            cpu.pc += 4;
        }
        OrcReg { ra, rs, rb, rc } => {
            let result = gpr(cpu, rs) | !gpr(cpu, rb);
            set_gpr(cpu, ra, result);
            if rc {
                set_cr0(cpu, result as i32);
            }
            cpu.pc += 4;
        }
        EqvReg { ra, rs, rb, rc } => {
            let result = !(gpr(cpu, rs) ^ gpr(cpu, rb));
            set_gpr(cpu, ra, result);
            if rc {
                set_cr0(cpu, result as i32);
            }
            cpu.pc += 4;
        }

        Rlwinm { ra, rs, sh, mb, me, rc } => {
            let rotated = gpr(cpu, rs).rotate_left(sh as u32);
            let result = rotated & mkmask(mb, me);
            set_gpr(cpu, ra, result);
            if rc {
                set_cr0(cpu, result as i32);
            }
            cpu.pc += 4;
        }
        Rlwimi { ra, rs, sh, mb, me, rc } => {
            let rotated = gpr(cpu, rs).rotate_left(sh as u32);
            let mask = mkmask(mb, me);
            let result = (rotated & mask) | (gpr(cpu, ra) & !mask);
            set_gpr(cpu, ra, result);
            if rc {
                set_cr0(cpu, result as i32);
            }
            cpu.pc += 4;
        }
        Rlwnm { ra, rs, rb, mb, me, rc } => {
            let sh = gpr(cpu, rb) & 0x1f;
            let rotated = gpr(cpu, rs).rotate_left(sh);
            let result = rotated & mkmask(mb, me);
            set_gpr(cpu, ra, result);
            if rc {
                set_cr0(cpu, result as i32);
            }
            cpu.pc += 4;
        }
        Sraw { ra, rs, rb, rc } => {
            let val = gpr(cpu, rs);
            let sh = gpr(cpu, rb) & 0x3f;
            let (result, carry) = if sh > 31 {
                ((val as i32) >> 31, val & 0x8000_0000 != 0)
            } else {
                ((val as i32) >> sh, sh != 0 && val & 0x8000_0000 != 0 && val & mkmask(32 - sh as u8, 31) != 0)
            };
            set_gpr(cpu, ra, result as u32);
            if carry {
                cpu.xer |= XER_CA;
            } else {
                cpu.xer &= !XER_CA;
            }
            if rc {
                set_cr0(cpu, result);
            }
            cpu.pc += 4;
        }
        Srawi { ra, rs, sh, rc } => {
            let val = gpr(cpu, rs);
            let result = (val as i32) >> sh;
            let carry = sh != 0 && val & 0x8000_0000 != 0 && val & mkmask(32 - sh, 31) != 0;
            set_gpr(cpu, ra, result as u32);
            if carry {
                cpu.xer |= XER_CA;
            } else {
                cpu.xer &= !XER_CA;
            }
            if rc {
                set_cr0(cpu, result);
            }
            cpu.pc += 4;
        }

        CmpImm { crf, ra, simm } => {
            cmp_signed(cpu, crf, gpr(cpu, ra) as i32, simm as i32);
            cpu.pc += 4;
        }
        CmpLImm { crf, ra, uimm } => {
            cmp_unsigned(cpu, crf, gpr(cpu, ra), uimm as u32);
            cpu.pc += 4;
        }
        CmpReg { crf, ra, rb } => {
            cmp_signed(cpu, crf, gpr(cpu, ra) as i32, gpr(cpu, rb) as i32);
            cpu.pc += 4;
        }
        CmpLReg { crf, ra, rb } => {
            cmp_unsigned(cpu, crf, gpr(cpu, ra), gpr(cpu, rb));
            cpu.pc += 4;
        }

        MfCr { rd } => {
            set_gpr(cpu, rd, cpu.cr);
            cpu.pc += 4;
        }
        MtCrf { fxm, rs } => {
            let mut mask = 0u32;
            for i in 0..8 {
                if fxm & (1 << (7 - i)) != 0 {
                    mask |= 0xf << (28 - i * 4);
                }
            }
            cpu.cr = (cpu.cr & !mask) | (gpr(cpu, rs) & mask);
            cpu.pc += 4;
        }
        MfMsr { rd } => {
            if !priv_mode {
                cpu.raise_prog_exception(mmu, ProgReason::Privileged);
                return Ok(ExecResult::Aborted);
            }
            set_gpr(cpu, rd, cpu.msr);
            cpu.pc += 4;
        }
        MtMsr { rs } => {
            if !priv_mode {
                cpu.raise_prog_exception(mmu, ProgReason::Privileged);
                return Ok(ExecResult::Aborted);
            }
            let v = gpr(cpu, rs);
            cpu.set_msr(mmu, v);
            cpu.pc += 4;
        }
        MfSpr { rd, spr } => {
            if spr_privileged(spr) && !priv_mode {
                cpu.raise_prog_exception(mmu, ProgReason::Privileged);
                return Ok(ExecResult::Aborted);
            }
            let value = match spr {
                SPR_XER => cpu.xer & 0xE000_007F,
                SPR_LR => cpu.lr,
                SPR_CTR => cpu.ctr,
                SPR_SRR0 => cpu.srr0,
                SPR_SRR1 => cpu.srr1,
                SPR_DAR => cpu.dar,
                SPR_DSISR => cpu.dsisr,
                SPR_DEC => cpu.dec,
                SPR_SDR1 => cpu.sdr1,
                SPR_HID0 => cpu.hid0,
                SPR_HID1 => cpu.hid1,
                SPR_PIR => cpu.pir,
                s if s >= SPR_SPRG0 && s <= SPR_SPRG3 => cpu.sprg[(s - SPR_SPRG0) as usize],
                s if (SPR_IBAT_BASE..SPR_IBAT_BASE + 8).contains(&s) => {
                    let (n, upper) = bat_index(s, SPR_IBAT_BASE);
                    if upper {
                        cpu.ibatu[n]
                    } else {
                        cpu.ibatl[n]
                    }
                }
                s if (SPR_DBAT_BASE..SPR_DBAT_BASE + 8).contains(&s) => {
                    let (n, upper) = bat_index(s, SPR_DBAT_BASE);
                    if upper {
                        cpu.dbatu[n]
                    } else {
                        cpu.dbatl[n]
                    }
                }
                _ => {
                    cpu.raise_prog_exception(mmu, ProgReason::Illegal);
                    return Ok(ExecResult::Aborted);
                }
            };
            set_gpr(cpu, rd, value);
            cpu.pc += 4;
        }
        MtSpr { spr, rs } => {
            if spr_privileged(spr) && !priv_mode {
                cpu.raise_prog_exception(mmu, ProgReason::Privileged);
                return Ok(ExecResult::Aborted);
            }
            let v = gpr(cpu, rs);
            match spr {
                SPR_XER => cpu.xer = v & 0xE000_007F,
                SPR_LR => cpu.lr = v,
                SPR_CTR => cpu.ctr = v,
                SPR_SRR0 => cpu.srr0 = v,
                SPR_SRR1 => cpu.srr1 = v,
                SPR_DAR => cpu.dar = v,
                SPR_DSISR => cpu.dsisr = v,
                SPR_DEC => cpu.dec = v,
                SPR_SDR1 => {
                    cpu.sdr1 = v;
                    mmu.set_sdr1(v);
                }
                SPR_HID0 => cpu.hid0 = v,
                SPR_HID1 => cpu.hid1 = v,
                SPR_PIR => cpu.pir = v,
                s if s >= SPR_SPRG0 && s <= SPR_SPRG3 => cpu.sprg[(s - SPR_SPRG0) as usize] = v,
                s if (SPR_IBAT_BASE..SPR_IBAT_BASE + 8).contains(&s) => {
                    let (n, upper) = bat_index(s, SPR_IBAT_BASE);
                    if upper {
                        cpu.ibatu[n] = v;
                        mmu.set_ibat_upper(n, v);
                    } else {
                        cpu.ibatl[n] = v;
                        mmu.set_ibat_lower(n, v);
                    }
                }
                s if (SPR_DBAT_BASE..SPR_DBAT_BASE + 8).contains(&s) => {
                    let (n, upper) = bat_index(s, SPR_DBAT_BASE);
                    if upper {
                        cpu.dbatu[n] = v;
                        mmu.set_dbat_upper(n, v);
                    } else {
                        cpu.dbatl[n] = v;
                        mmu.set_dbat_lower(n, v);
                    }
                }
                _ => {
                    cpu.raise_prog_exception(mmu, ProgReason::Illegal);
                    return Ok(ExecResult::Aborted);
                }
            }
            cpu.pc += 4;
        }
        MfSr { rd, sr } => {
            if !priv_mode {
                cpu.raise_prog_exception(mmu, ProgReason::Privileged);
                return Ok(ExecResult::Aborted);
            }
            set_gpr(cpu, rd, cpu.sr[sr as usize]);
            cpu.pc += 4;
        }
        MtSr { sr, rs } => {
            if !priv_mode {
                cpu.raise_prog_exception(mmu, ProgReason::Privileged);
                return Ok(ExecResult::Aborted);
            }
            let v = gpr(cpu, rs);
            cpu.sr[sr as usize] = v;
            mmu.set_segment_reg(sr as usize, v);
            cpu.pc += 4;
        }
        Rfi => {
            if !priv_mode {
                cpu.raise_prog_exception(mmu, ProgReason::Privileged);
                return Ok(ExecResult::Aborted);
            }
            cpu.rfi(mmu);
        }

        B { li, aa, lk } => {
            let pc_before = cpu.pc;
            let target = if aa { li as u32 } else { pc_before.wrapping_add(li as u32) };
            if lk {
                cpu.lr = pc_before.wrapping_add(4);
            }
            if target == pc_before && cpu.msr & MSR_EE == 0 {
                return Ok(ExecResult::Halted);
            }
            cpu.pc = target;
        }
        Bc { bo, bi, bd, aa, lk } => {
            let pc_before = cpu.pc;
            let taken = bo_taken(cpu, bo, bi);
            if lk {
                cpu.lr = pc_before.wrapping_add(4);
            }
            if taken {
                let target = if aa { bd as i32 as u32 } else { pc_before.wrapping_add(bd as i32 as u32) };
                if target == pc_before && cpu.msr & MSR_EE == 0 {
                    return Ok(ExecResult::Halted);
                }
                cpu.pc = target;
            } else {
                cpu.pc = pc_before.wrapping_add(4);
            }
        }
        Bclr { bo, bi, lk } => {
            let pc_before = cpu.pc;
            let taken = bo_taken(cpu, bo, bi);
            let target = cpu.lr & !3;
            if lk {
                cpu.lr = pc_before.wrapping_add(4);
            }
            cpu.pc = if taken { target } else { pc_before.wrapping_add(4) };
        }
        Bcctr { bo, bi, lk } => {
            let pc_before = cpu.pc;
            let taken = bo_taken(cpu, bo, bi);
            let target = cpu.ctr & !3;
            if lk {
                cpu.lr = pc_before.wrapping_add(4);
            }
            cpu.pc = if taken { target } else { pc_before.wrapping_add(4) };
        }

        Sc => {
            cpu.raise_sc_exception(mmu);
            return Ok(ExecResult::Aborted);
        }
        Tw { to, ra, rb } => {
            let a = gpr(cpu, ra) as i32;
            let b = gpr(cpu, rb) as i32;
            if trap_matches(to, a, b) {
                cpu.raise_prog_exception(mmu, ProgReason::Trap);
                return Ok(ExecResult::Aborted);
            }
            cpu.pc += 4;
        }
        Twi { to, ra, simm } => {
            let a = gpr(cpu, ra) as i32;
            let b = simm as i32;
            if trap_matches(to, a, b) {
                cpu.raise_prog_exception(mmu, ProgReason::Trap);
                return Ok(ExecResult::Aborted);
            }
            cpu.pc += 4;
        }

        Sync | Isync | Eieio => {
            // Architectural barriers, no-ops in this single-threaded model
            // (spec.md §5).
            cpu.pc += 4;
        }
        Tlbie { .. } => {
            mmu.tlbie(0);
            cpu.reservation = None;
            cpu.pc += 4;
        }
        Tlbia => {
            mmu.tlbia();
            cpu.reservation = None;
            cpu.pc += 4;
        }
        Icbi => {
            // Invalidating the block cache on `icbi` is the block cache's
            // job (spec.md §4.6); the interpreter has no block cache to
            // invalidate, so this is a no-op here.
            cpu.pc += 4;
        }

        Lswi { rd, ra, nb } => {
            let count = if nb == 0 { 32 } else { nb as u32 };
            let mut addr = gpr_ra0(cpu, ra);
            let mut reg = rd;
            let mut shift = 24i32;
            let mut word_acc = 0u32;
            let mut remaining = count;
            while remaining > 0 {
                let r = mmu.load8(bus, addr, priv_mode);
                let byte = match mem_outcome(cpu, mmu, true, false, addr, word, r)? {
                    Outcome::Value(v) => v,
                    Outcome::Aborted => return Ok(ExecResult::Aborted),
                };
                word_acc |= (byte as u32) << shift;
                shift -= 8;
                addr = addr.wrapping_add(1);
                remaining -= 1;
                if shift < 0 || remaining == 0 {
                    set_gpr(cpu, reg, word_acc);
                    reg = (reg + 1) % 32;
                    word_acc = 0;
                    shift = 24;
                }
            }
            cpu.pc += 4;
        }
        Lswx { rd, ra, rb } => {
            let count = cpu.xer & 0x7f;
            let mut addr = gpr_ra0(cpu, ra).wrapping_add(gpr(cpu, rb));
            let mut reg = rd;
            let mut shift = 24i32;
            let mut word_acc = 0u32;
            let mut remaining = count;
            while remaining > 0 {
                let r = mmu.load8(bus, addr, priv_mode);
                let byte = match mem_outcome(cpu, mmu, true, false, addr, word, r)? {
                    Outcome::Value(v) => v,
                    Outcome::Aborted => return Ok(ExecResult::Aborted),
                };
                word_acc |= (byte as u32) << shift;
                shift -= 8;
                addr = addr.wrapping_add(1);
                remaining -= 1;
                if shift < 0 || remaining == 0 {
                    set_gpr(cpu, reg, word_acc);
                    reg = (reg + 1) % 32;
                    word_acc = 0;
                    shift = 24;
                }
            }
            cpu.pc += 4;
        }
        Stswi { rs, ra, nb } => {
            let count = if nb == 0 { 32 } else { nb as u32 };
            let mut addr = gpr_ra0(cpu, ra);
            let mut reg = rs;
            let mut shift = 24i32;
            let mut remaining = count;
            while remaining > 0 {
                let byte = ((gpr(cpu, reg) >> shift) & 0xff) as u8;
                let r = mmu.store8(bus, addr, priv_mode, byte);
                match mem_outcome(cpu, mmu, false, false, addr, word, r)? {
                    Outcome::Value(()) => {}
                    Outcome::Aborted => return Ok(ExecResult::Aborted),
                }
                shift -= 8;
                addr = addr.wrapping_add(1);
                remaining -= 1;
                if shift < 0 {
                    reg = (reg + 1) % 32;
                    shift = 24;
                }
            }
            cpu.pc += 4;
        }
        Stswx { rs, ra, rb } => {
            let count = cpu.xer & 0x7f;
            let mut addr = gpr_ra0(cpu, ra).wrapping_add(gpr(cpu, rb));
            let mut reg = rs;
            let mut shift = 24i32;
            let mut remaining = count;
            while remaining > 0 {
                let byte = ((gpr(cpu, reg) >> shift) & 0xff) as u8;
                let r = mmu.store8(bus, addr, priv_mode, byte);
                match mem_outcome(cpu, mmu, false, false, addr, word, r)? {
                    Outcome::Value(()) => {}
                    Outcome::Aborted => return Ok(ExecResult::Aborted),
                }
                shift -= 8;
                addr = addr.wrapping_add(1);
                remaining -= 1;
                if shift < 0 {
                    reg = (reg + 1) % 32;
                    shift = 24;
                }
            }
            cpu.pc += 4;
        }

        Unknown(_) => {
            cpu.raise_prog_exception(mmu, ProgReason::Illegal);
            return Ok(ExecResult::Aborted);
        }
    }
    Ok(ExecResult::Normal)
}

fn trap_matches(to: u8, a: i32, b: i32) -> bool {
    (to & 0b10000 != 0 && a < b)
        || (to & 0b01000 != 0 && a > b)
        || (to & 0b00100 != 0 && a == b)
        || (to & 0b00010 != 0 && (a as u32) < (b as u32))
        || (to & 0b00001 != 0 && (a as u32) > (b as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::Ram;

    fn setup() -> (Cpu, Mmu, Bus) {
        let mut bus = Bus::new();
        bus.attach(Ram::new(0x10000), 0, 0x10000);
        (Cpu::new(), Mmu::new(), bus)
    }

    #[test]
    fn byte_swap_load() {
        let (mut cpu, mut mmu, mut bus) = setup();
        bus.write32(0, 0x8060_0004).unwrap(); // lwz r3, 4(r0)
        bus.write32(4, 0xAABB_CCDD).unwrap();
        cpu.pc = 0;
        let outcome = execute(&mut cpu, &mut mmu, &mut bus).unwrap();
        assert_eq!(outcome, ExecResult::Normal);
        assert_eq!(cpu.gpr[3], 0xAABB_CCDD);
        assert_eq!(cpu.pc, 4);
    }

    #[test]
    fn divwo_overflow_case() {
        let (mut cpu, mut mmu, mut bus) = setup();
        cpu.gpr[3] = 0x8000_0000;
        cpu.gpr[4] = 0xFFFF_FFFF;
        // divwo. r5, r3, r4
        let w = (31u32 << 26) | (5 << 21) | (3 << 16) | (4 << 11) | (1 << 10) | (491 << 1) | 1;
        bus.write32(0, w).unwrap();
        cpu.pc = 0;
        let outcome = execute(&mut cpu, &mut mmu, &mut bus).unwrap();
        assert_eq!(outcome, ExecResult::Normal);
        assert_eq!(cpu.gpr[5], 0x7FFF_FFFF);
        assert_eq!(cpu.xer & XER_OV, XER_OV);
        assert_eq!(cpu.xer & XER_SO, XER_SO);
    }

    #[test]
    fn cntlzw_zero_is_32() {
        let (mut cpu, mut mmu, mut bus) = setup();
        cpu.gpr[3] = 0;
        // cntlzw r4, r3  (xo 26)
        let w = (31u32 << 26) | (3 << 21) | (4 << 16) | (26 << 1);
        bus.write32(0, w).unwrap();
        cpu.pc = 0;
        execute(&mut cpu, &mut mmu, &mut bus).unwrap();
        assert_eq!(cpu.gpr[4], 32);
    }

    #[test]
    fn lwarx_stwcx_round_trip() {
        let (mut cpu, mut mmu, mut bus) = setup();
        bus.write32(0x1000, 0xDEAD).unwrap();
        cpu.gpr[1] = 0x1000;
        // lwarx r3, r0, r1
        let w1 = (31u32 << 26) | (3 << 21) | (0 << 16) | (1 << 11) | (20 << 1);
        bus.write32(0, w1).unwrap();
        cpu.pc = 0;
        execute(&mut cpu, &mut mmu, &mut bus).unwrap();
        assert_eq!(cpu.gpr[3], 0xDEAD);

        cpu.gpr[4] = 0xBEEF;
        // stwcx. r4, r0, r1
        let w2 = (31u32 << 26) | (4 << 21) | (0 << 16) | (1 << 11) | (150 << 1) | 1;
        bus.write32(4, w2).unwrap();
        cpu.pc = 4;
        execute(&mut cpu, &mut mmu, &mut bus).unwrap();
        assert_eq!(bus.read32(0x1000).unwrap(), 0xBEEF);
        assert_eq!(cpu.cr >> 28 & 0b0010, 0b0010);

        // Repeat immediately: reservation is gone, must fail.
        cpu.pc = 4;
        bus.write32(0x1000, 0xBEEF).unwrap();
        execute(&mut cpu, &mut mmu, &mut bus).unwrap();
        assert_eq!(cpu.cr >> 28 & 0b0010, 0);
        assert_eq!(bus.read32(0x1000).unwrap(), 0xBEEF);
    }
}
