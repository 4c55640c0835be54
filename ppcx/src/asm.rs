// asm.rs - Minimal PowerPC encoder
//
// Builds guest instruction words for hand-written fragments (thunks, tests,
// trampolines). Operand order follows assembler syntax; memory forms take
// `(rt, displacement, ra)` as in `lwz rt, d(ra)`.

fn d_form(primary: u32, rt: u8, ra: u8, imm: u16) -> u32 {
    (primary << 26) | ((rt as u32) << 21) | ((ra as u32) << 16) | imm as u32
}

fn x_form(rt: u8, ra: u8, rb: u8, xo: u32) -> u32 {
    (31 << 26) | ((rt as u32) << 21) | ((ra as u32) << 16) | ((rb as u32) << 11) | (xo << 1)
}

fn spr_field(spr: u32) -> u32 {
    ((spr & 0x1F) << 16) | ((spr >> 5) << 11)
}

pub fn addi(rt: u8, ra: u8, si: i16) -> u32 {
    d_form(14, rt, ra, si as u16)
}

pub fn addis(rt: u8, ra: u8, si: i16) -> u32 {
    d_form(15, rt, ra, si as u16)
}

pub fn li(rt: u8, si: i16) -> u32 {
    addi(rt, 0, si)
}

pub fn lis(rt: u8, si: i16) -> u32 {
    addis(rt, 0, si)
}

pub fn mulli(rt: u8, ra: u8, si: i16) -> u32 {
    d_form(7, rt, ra, si as u16)
}

pub fn ori(ra: u8, rs: u8, ui: u16) -> u32 {
    d_form(24, rs, ra, ui)
}

pub fn oris(ra: u8, rs: u8, ui: u16) -> u32 {
    d_form(25, rs, ra, ui)
}

pub fn andi_(ra: u8, rs: u8, ui: u16) -> u32 {
    d_form(28, rs, ra, ui)
}

pub fn nop() -> u32 {
    ori(0, 0, 0)
}

pub fn add(rt: u8, ra: u8, rb: u8) -> u32 {
    x_form(rt, ra, rb, 266)
}

pub fn subf(rt: u8, ra: u8, rb: u8) -> u32 {
    x_form(rt, ra, rb, 40)
}

pub fn mullw(rt: u8, ra: u8, rb: u8) -> u32 {
    x_form(rt, ra, rb, 235)
}

pub fn divw(rt: u8, ra: u8, rb: u8) -> u32 {
    x_form(rt, ra, rb, 491)
}

pub fn neg(rt: u8, ra: u8) -> u32 {
    x_form(rt, ra, 0, 104)
}

pub fn and(ra: u8, rs: u8, rb: u8) -> u32 {
    x_form(rs, ra, rb, 28)
}

pub fn or(ra: u8, rs: u8, rb: u8) -> u32 {
    x_form(rs, ra, rb, 444)
}

/// Record form of `or`
pub fn or_(ra: u8, rs: u8, rb: u8) -> u32 {
    or(ra, rs, rb) | 1
}

pub fn xor(ra: u8, rs: u8, rb: u8) -> u32 {
    x_form(rs, ra, rb, 316)
}

pub fn mr(ra: u8, rs: u8) -> u32 {
    or(ra, rs, rs)
}

pub fn slw(ra: u8, rs: u8, rb: u8) -> u32 {
    x_form(rs, ra, rb, 24)
}

pub fn srw(ra: u8, rs: u8, rb: u8) -> u32 {
    x_form(rs, ra, rb, 536)
}

pub fn srawi(ra: u8, rs: u8, sh: u8) -> u32 {
    x_form(rs, ra, sh, 824)
}

pub fn extsh(ra: u8, rs: u8) -> u32 {
    x_form(rs, ra, 0, 922)
}

pub fn rlwinm(ra: u8, rs: u8, sh: u8, mb: u8, me: u8) -> u32 {
    (21 << 26)
        | ((rs as u32) << 21)
        | ((ra as u32) << 16)
        | ((sh as u32) << 11)
        | ((mb as u32) << 6)
        | ((me as u32) << 1)
}

pub fn slwi(ra: u8, rs: u8, n: u8) -> u32 {
    rlwinm(ra, rs, n, 0, 31 - n)
}

pub fn rldicl(ra: u8, rs: u8, sh: u8, mb: u8) -> u32 {
    let sh = sh as u32;
    let mb = mb as u32;
    (30 << 26)
        | ((rs as u32) << 21)
        | ((ra as u32) << 16)
        | ((sh & 0x1F) << 11)
        | ((((mb & 0x1F) << 1) | (mb >> 5)) << 5)
        | ((sh >> 5) << 1)
}

pub fn cmpwi(crf: u8, ra: u8, si: i16) -> u32 {
    d_form(11, crf << 2, ra, si as u16)
}

pub fn cmplwi(crf: u8, ra: u8, ui: u16) -> u32 {
    d_form(10, crf << 2, ra, ui)
}

pub fn cmpw(crf: u8, ra: u8, rb: u8) -> u32 {
    x_form(crf << 2, ra, rb, 0)
}

/// Relative branch
pub fn b(offset: i32) -> u32 {
    (18 << 26) | (offset as u32 & 0x03FF_FFFC)
}

/// Relative branch and link
pub fn bl(offset: i32) -> u32 {
    b(offset) | 1
}

/// Conditional relative branch
pub fn bc(bo: u8, bi: u8, offset: i16) -> u32 {
    d_form(16, bo, bi, offset as u16 & 0xFFFC)
}

pub fn beq(crf: u8, offset: i16) -> u32 {
    bc(12, crf * 4 + 2, offset)
}

pub fn bne(crf: u8, offset: i16) -> u32 {
    bc(4, crf * 4 + 2, offset)
}

pub fn blt(crf: u8, offset: i16) -> u32 {
    bc(12, crf * 4, offset)
}

pub fn bgt(crf: u8, offset: i16) -> u32 {
    bc(12, crf * 4 + 1, offset)
}

/// Decrement CTR, branch if it is non-zero
pub fn bdnz(offset: i16) -> u32 {
    bc(16, 0, offset)
}

pub fn blr() -> u32 {
    0x4E80_0020
}

pub fn blrl() -> u32 {
    blr() | 1
}

pub fn bctr() -> u32 {
    0x4E80_0420
}

pub fn bctrl() -> u32 {
    bctr() | 1
}

pub fn mfspr(rt: u8, spr: u32) -> u32 {
    (31 << 26) | ((rt as u32) << 21) | spr_field(spr) | (339 << 1)
}

pub fn mtspr(spr: u32, rs: u8) -> u32 {
    (31 << 26) | ((rs as u32) << 21) | spr_field(spr) | (467 << 1)
}

pub fn mflr(rt: u8) -> u32 {
    mfspr(rt, 8)
}

pub fn mtlr(rs: u8) -> u32 {
    mtspr(8, rs)
}

pub fn mfctr(rt: u8) -> u32 {
    mfspr(rt, 9)
}

pub fn mtctr(rs: u8) -> u32 {
    mtspr(9, rs)
}

pub fn mfcr(rt: u8) -> u32 {
    x_form(rt, 0, 0, 19)
}

pub fn lwz(rt: u8, d: i16, ra: u8) -> u32 {
    d_form(32, rt, ra, d as u16)
}

pub fn lbz(rt: u8, d: i16, ra: u8) -> u32 {
    d_form(34, rt, ra, d as u16)
}

pub fn lhz(rt: u8, d: i16, ra: u8) -> u32 {
    d_form(40, rt, ra, d as u16)
}

pub fn stw(rs: u8, d: i16, ra: u8) -> u32 {
    d_form(36, rs, ra, d as u16)
}

pub fn stwu(rs: u8, d: i16, ra: u8) -> u32 {
    d_form(37, rs, ra, d as u16)
}

pub fn stb(rs: u8, d: i16, ra: u8) -> u32 {
    d_form(38, rs, ra, d as u16)
}

pub fn sth(rs: u8, d: i16, ra: u8) -> u32 {
    d_form(44, rs, ra, d as u16)
}

pub fn ld(rt: u8, ds: i16, ra: u8) -> u32 {
    d_form(58, rt, ra, ds as u16 & 0xFFFC)
}

pub fn std(rs: u8, ds: i16, ra: u8) -> u32 {
    d_form(62, rs, ra, ds as u16 & 0xFFFC)
}

pub fn lwzx(rt: u8, ra: u8, rb: u8) -> u32 {
    x_form(rt, ra, rb, 23)
}

pub fn stwx(rs: u8, ra: u8, rb: u8) -> u32 {
    x_form(rs, ra, rb, 151)
}

pub fn sc() -> u32 {
    0x4400_0002
}

/// Serialize instruction words as big-endian bytes
pub fn assemble(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_encodings() {
        assert_eq!(mflr(0), 0x7C08_02A6);
        assert_eq!(mtlr(0), 0x7C08_03A6);
        assert_eq!(mtctr(12), 0x7D89_03A6);
        assert_eq!(nop(), 0x6000_0000);
        assert_eq!(li(3, 1), 0x3860_0001);
        assert_eq!(stwu(1, -16, 1), 0x9421_FFF0);
        assert_eq!(b(8), 0x4800_0008);
        assert_eq!(bl(-4), 0x4BFF_FFFD);
        assert_eq!(beq(0, 8), 0x4182_0008);
    }

    #[test]
    fn test_assemble_is_big_endian() {
        assert_eq!(assemble(&[blr()]), vec![0x4E, 0x80, 0x00, 0x20]);
    }
}
