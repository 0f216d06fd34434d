// Instruction decoder (spec.md §4.5). The origin's template/CRTP-mixin
// decoder is flattened per spec.md §9 REDESIGN FLAGS into an ordinary data
// type plus a nested `match` on primary and extended opcode — no virtual
// dispatch, no decode table generation step, just a switch over bitfields
// extracted with free functions, matching the style em68k's `fields.rs`
// uses for its own bitfield helpers.
//
// Field naming follows the architecture manual: `rd`/`rs` name the register
// written for D-form loads and XFX moves; for X-form logical/shift
// instructions the destination is conventionally `rA` and the source `rS`,
// which this module keeps instead of renaming to `rd`/`rs` so the semantic
// code in `interp.rs` reads the same way the manual does.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Lwz { rd: u8, ra: u8, d: i16 },
    Lhz { rd: u8, ra: u8, d: i16 },
    Lbz { rd: u8, ra: u8, d: i16 },
    Stw { rs: u8, ra: u8, d: i16 },
    Sth { rs: u8, ra: u8, d: i16 },
    Stb { rs: u8, ra: u8, d: i16 },
    Lwarx { rd: u8, ra: u8, rb: u8 },
    Stwcx { rs: u8, ra: u8, rb: u8 },

    Addi { rd: u8, ra: u8, simm: i16 },
    Addis { rd: u8, ra: u8, simm: i16 },
    Subfic { rd: u8, ra: u8, simm: i16 },
    AddReg { rd: u8, ra: u8, rb: u8, oe: bool, rc: bool },
    SubfReg { rd: u8, ra: u8, rb: u8, oe: bool, rc: bool },
    DivwReg { rd: u8, ra: u8, rb: u8, oe: bool, rc: bool, unsigned: bool },
    MullwReg { rd: u8, ra: u8, rb: u8, oe: bool, rc: bool },
    MulhwReg { rd: u8, ra: u8, rb: u8, rc: bool, unsigned: bool },
    Cntlzw { ra: u8, rs: u8, rc: bool },

    OriImm { ra: u8, rs: u8, uimm: u16 },
    OrisImm { ra: u8, rs: u8, uimm: u16 },
    XoriImm { ra: u8, rs: u8, uimm: u16 },
    XorisImm { ra: u8, rs: u8, uimm: u16 },
    AndiImm { ra: u8, rs: u8, uimm: u16 },
    AndisImm { ra: u8, rs: u8, uimm: u16 },
    AndReg { ra: u8, rs: u8, rb: u8, rc: bool },
    OrReg { ra: u8, rs: u8, rb: u8, rc: bool },
    XorReg { ra: u8, rs: u8, rb: u8, rc: bool },
    NandReg { ra: u8, rs: u8, rb: u8, rc: bool },
    NorReg { ra: u8, rs: u8, rb: u8, rc: bool },
    AndcReg { ra: u8, rs: u8, rb: u8, rc: bool },
    OrcReg { ra: u8, rs: u8, rb: u8, rc: bool },
    EqvReg { ra: u8, rs: u8, rb: u8, rc: bool },

    Rlwinm { ra: u8, rs: u8, sh: u8, mb: u8, me: u8, rc: bool },
    Rlwimi { ra: u8, rs: u8, sh: u8, mb: u8, me: u8, rc: bool },
    Rlwnm { ra: u8, rs: u8, rb: u8, mb: u8, me: u8, rc: bool },
    Sraw { ra: u8, rs: u8, rb: u8, rc: bool },
    Srawi { ra: u8, rs: u8, sh: u8, rc: bool },

    CmpImm { crf: u8, ra: u8, simm: i16 },
    CmpLImm { crf: u8, ra: u8, uimm: u16 },
    CmpReg { crf: u8, ra: u8, rb: u8 },
    CmpLReg { crf: u8, ra: u8, rb: u8 },

    MfCr { rd: u8 },
    MtCrf { fxm: u8, rs: u8 },
    MfMsr { rd: u8 },
    MtMsr { rs: u8 },
    MfSpr { rd: u8, spr: u16 },
    MtSpr { spr: u16, rs: u8 },
    MfSr { rd: u8, sr: u8 },
    MtSr { sr: u8, rs: u8 },
    Rfi,

    B { li: i32, aa: bool, lk: bool },
    Bc { bo: u8, bi: u8, bd: i16, aa: bool, lk: bool },
    Bclr { bo: u8, bi: u8, lk: bool },
    Bcctr { bo: u8, bi: u8, lk: bool },

    Sc,
    Tw { to: u8, ra: u8, rb: u8 },
    Twi { to: u8, ra: u8, simm: i16 },

    Sync,
    Isync,
    Eieio,
    Tlbie { rb: u8 },
    Tlbia,
    Icbi,

    Lswi { rd: u8, ra: u8, nb: u8 },
    Lswx { rd: u8, ra: u8, rb: u8 },
    Stswi { rs: u8, ra: u8, nb: u8 },
    Stswx { rs: u8, ra: u8, rb: u8 },

    Lmw { rd: u8, ra: u8, d: i16 },
    Stmw { rs: u8, ra: u8, d: i16 },

    Unknown(u32),
}

fn field_op(w: u32) -> u32 {
    w >> 26
}
fn field_rdrs(w: u32) -> u8 {
    ((w >> 21) & 0x1f) as u8
}
fn field_ra(w: u32) -> u8 {
    ((w >> 16) & 0x1f) as u8
}
fn field_rb(w: u32) -> u8 {
    ((w >> 11) & 0x1f) as u8
}
fn field_d(w: u32) -> i16 {
    (w & 0xffff) as i16
}
fn field_uimm(w: u32) -> u16 {
    (w & 0xffff) as u16
}
fn field_xo10(w: u32) -> u32 {
    (w >> 1) & 0x3ff
}
fn field_xo9(w: u32) -> u32 {
    (w >> 1) & 0x1ff
}
fn field_oe(w: u32) -> bool {
    (w >> 10) & 1 != 0
}
fn field_rc(w: u32) -> bool {
    w & 1 != 0
}
fn field_sh(w: u32) -> u8 {
    ((w >> 11) & 0x1f) as u8
}
fn field_mb(w: u32) -> u8 {
    ((w >> 6) & 0x1f) as u8
}
fn field_me(w: u32) -> u8 {
    ((w >> 1) & 0x1f) as u8
}
fn field_crf(w: u32) -> u8 {
    ((w >> 23) & 0x7) as u8
}
fn field_bo(w: u32) -> u8 {
    ((w >> 21) & 0x1f) as u8
}
fn field_bi(w: u32) -> u8 {
    ((w >> 16) & 0x1f) as u8
}
fn field_bd(w: u32) -> i16 {
    (w as u16 & 0xfffc) as i16
}
fn field_aa(w: u32) -> bool {
    (w >> 1) & 1 != 0
}
fn field_lk(w: u32) -> bool {
    w & 1 != 0
}
fn field_li(w: u32) -> i32 {
    let raw = (w & 0x03ff_fffc) as i32;
    (raw << 6) >> 6
}
fn field_spr(w: u32) -> u16 {
    let raw = (w >> 11) & 0x3ff;
    (((raw & 0x1f) << 5) | (raw >> 5)) as u16
}
fn field_sr(w: u32) -> u8 {
    ((w >> 16) & 0xf) as u8
}
fn field_fxm(w: u32) -> u8 {
    ((w >> 12) & 0xff) as u8
}
fn field_to(w: u32) -> u8 {
    field_rdrs(w)
}
fn field_nb(w: u32) -> u8 {
    field_rb(w)
}

pub fn decode(w: u32) -> Instruction {
    use Instruction::*;
    let op = field_op(w);
    match op {
        3 => Twi { to: field_to(w), ra: field_ra(w), simm: field_d(w) },
        10 => CmpLImm { crf: field_crf(w), ra: field_ra(w), uimm: field_uimm(w) },
        11 => CmpImm { crf: field_crf(w), ra: field_ra(w), simm: field_d(w) },
        14 => Addi { rd: field_rdrs(w), ra: field_ra(w), simm: field_d(w) },
        15 => Addis { rd: field_rdrs(w), ra: field_ra(w), simm: field_d(w) },
        16 => Bc { bo: field_bo(w), bi: field_bi(w), bd: field_bd(w), aa: field_aa(w), lk: field_lk(w) },
        17 => Sc,
        18 => B { li: field_li(w), aa: field_aa(w), lk: field_lk(w) },
        19 => match field_xo10(w) {
            16 => Bclr { bo: field_bo(w), bi: field_bi(w), lk: field_lk(w) },
            50 => Rfi,
            150 => Isync,
            528 => Bcctr { bo: field_bo(w), bi: field_bi(w), lk: field_lk(w) },
            _ => Unknown(w),
        },
        20 => Rlwimi { ra: field_ra(w), rs: field_rdrs(w), sh: field_sh(w), mb: field_mb(w), me: field_me(w), rc: field_rc(w) },
        21 => Rlwinm { ra: field_ra(w), rs: field_rdrs(w), sh: field_sh(w), mb: field_mb(w), me: field_me(w), rc: field_rc(w) },
        23 => Rlwnm { ra: field_ra(w), rs: field_rdrs(w), rb: field_rb(w), mb: field_mb(w), me: field_me(w), rc: field_rc(w) },
        24 => OriImm { ra: field_ra(w), rs: field_rdrs(w), uimm: field_uimm(w) },
        25 => OrisImm { ra: field_ra(w), rs: field_rdrs(w), uimm: field_uimm(w) },
        26 => XoriImm { ra: field_ra(w), rs: field_rdrs(w), uimm: field_uimm(w) },
        27 => XorisImm { ra: field_ra(w), rs: field_rdrs(w), uimm: field_uimm(w) },
        28 => AndiImm { ra: field_ra(w), rs: field_rdrs(w), uimm: field_uimm(w) },
        29 => AndisImm { ra: field_ra(w), rs: field_rdrs(w), uimm: field_uimm(w) },
        31 => decode_31(w),
        32 => Lwz { rd: field_rdrs(w), ra: field_ra(w), d: field_d(w) },
        34 => Lbz { rd: field_rdrs(w), ra: field_ra(w), d: field_d(w) },
        36 => Stw { rs: field_rdrs(w), ra: field_ra(w), d: field_d(w) },
        38 => Stb { rs: field_rdrs(w), ra: field_ra(w), d: field_d(w) },
        40 => Lhz { rd: field_rdrs(w), ra: field_ra(w), d: field_d(w) },
        44 => Sth { rs: field_rdrs(w), ra: field_ra(w), d: field_d(w) },
        46 => Lmw { rd: field_rdrs(w), ra: field_ra(w), d: field_d(w) },
        47 => Stmw { rs: field_rdrs(w), ra: field_ra(w), d: field_d(w) },
        _ => Unknown(w),
    }
}

fn decode_31(w: u32) -> Instruction {
    use Instruction::*;
    let rd = field_rdrs(w);
    let rs = rd;
    let ra = field_ra(w);
    let rb = field_rb(w);
    let rc = field_rc(w);
    let oe = field_oe(w);
    match field_xo9(w) {
        0 => return CmpReg { crf: field_crf(w), ra, rb },
        32 => return CmpLReg { crf: field_crf(w), ra, rb },
        4 => return Tw { to: field_to(w), ra, rb },
        19 => return MfCr { rd },
        20 => return Lwarx { rd, ra, rb },
        26 => return Cntlzw { ra, rs, rc },
        28 => return AndReg { ra, rs, rb, rc },
        40 => return SubfReg { rd, ra, rb, oe, rc },
        60 => return AndcReg { ra, rs, rb, rc },
        75 => return MulhwReg { rd, ra, rb, rc, unsigned: false },
        83 => return MfMsr { rd },
        124 => return NorReg { ra, rs, rb, rc },
        144 => return MtCrf { fxm: field_fxm(w), rs },
        146 => return MtMsr { rs },
        150 => return Stwcx { rs, ra, rb },
        210 => return MtSr { sr: field_sr(w), rs },
        235 => return MullwReg { rd, ra, rb, oe, rc },
        266 => return AddReg { rd, ra, rb, oe, rc },
        284 => return EqvReg { ra, rs, rb, rc },
        306 => return Tlbie { rb },
        316 => return XorReg { ra, rs, rb, rc },
        339 => return MfSpr { rd, spr: field_spr(w) },
        11 => return MulhwReg { rd, ra, rb, rc, unsigned: true },
        370 => return Tlbia,
        412 => return OrcReg { ra, rs, rb, rc },
        444 => return OrReg { ra, rs, rb, rc },
        459 => return DivwReg { rd, ra, rb, oe, rc, unsigned: true },
        467 => return MtSpr { spr: field_spr(w), rs },
        476 => return NandReg { ra, rs, rb, rc },
        491 => return DivwReg { rd, ra, rb, oe, rc, unsigned: false },
        533 => return Lswx { rd, ra, rb },
        595 => return MfSr { rd, sr: field_sr(w) },
        598 => return Sync,
        597 => {}
        _ => {}
    }
    // A few opcodes collide with the 9-bit XO mask for OE-bearing forms
    // (icbi/lswi/stswi/stswx/eieio carry no OE bit, so they're matched on
    // the full 10-bit field instead).
    match field_xo10(w) {
        597 => Lswi { rd, ra, nb: field_nb(w) },
        725 => Stswi { rs, ra, nb: field_nb(w) },
        661 => Stswx { rs, ra, rb },
        792 => Sraw { ra, rs, rb, rc },
        824 => Srawi { ra, rs, sh: field_sh(w), rc },
        854 => Eieio,
        982 => Icbi,
        _ => Unknown(w),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_addi() {
        // addi r3, r0, 7
        let w = 0x3860_0007;
        assert_eq!(decode(w), Instruction::Addi { rd: 3, ra: 0, simm: 7 });
    }

    #[test]
    fn decodes_lwz() {
        // lwz r3, 0(r0)
        let w = 0x8060_0000;
        assert_eq!(decode(w), Instruction::Lwz { rd: 3, ra: 0, d: 0 });
    }

    #[test]
    fn decodes_divwo_dot() {
        // divwo. r5, r3, r4  (primary 31, rd=5, ra=3, rb=4, oe=1, xo=491, rc=1)
        let w = (31 << 26) | (5 << 21) | (3 << 16) | (4 << 11) | (1 << 10) | (491 << 1) | 1;
        assert_eq!(decode(w), Instruction::DivwReg { rd: 5, ra: 3, rb: 4, oe: true, rc: true, unsigned: false });
    }

    #[test]
    fn unknown_falls_through() {
        assert_eq!(decode(0), Instruction::Unknown(0));
    }
}
