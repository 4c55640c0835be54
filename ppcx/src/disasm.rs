// disasm.rs - PowerPC disassembler
//
// Decodes big-endian 32-bit PowerPC instructions into structured form for
// analysis and translation. Field accessors follow the architecture's field
// names; bit positions are given LSB-0.

use crate::memory::{Memory, MemoryError};

/// A decoded PowerPC instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// Guest address
    pub addr: u32,
    /// Raw instruction word
    pub code: u32,
    /// Decoded opcode
    pub opcode: Opcode,
}

/// PowerPC opcodes (integer subset)
#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Arithmetic, immediate
    MULLI,
    SUBFIC,
    ADDIC,
    ADDIC_,
    ADDI,
    ADDIS,

    // Compare
    CMPI,
    CMPLI,
    CMP,
    CMPL,

    // Branch and system
    BC,
    SC,
    B,
    BCLR,
    BCCTR,

    // Condition register
    MCRF,
    CRAND,
    CRANDC,
    CREQV,
    CRNAND,
    CRNOR,
    CROR,
    CRORC,
    CRXOR,
    MFCR,
    MTCRF,

    // Rotate
    RLWIMI,
    RLWINM,
    RLWNM,
    RLDICL,
    RLDICR,

    // Logical, immediate
    ORI,
    ORIS,
    XORI,
    XORIS,
    ANDI_,
    ANDIS_,

    // Arithmetic, register
    ADD,
    ADDC,
    ADDE,
    ADDZE,
    SUBF,
    SUBFC,
    SUBFE,
    NEG,
    MULLW,
    MULHW,
    MULHWU,
    MULLD,
    DIVW,
    DIVWU,
    DIVD,
    DIVDU,

    // Logical, register
    AND,
    ANDC,
    OR,
    NOR,
    XOR,
    EXTSB,
    EXTSH,
    EXTSW,
    CNTLZW,
    CNTLZD,

    // Shift
    SLW,
    SRW,
    SRAW,
    SRAWI,
    SLD,
    SRD,

    // Loads
    LWZ,
    LWZU,
    LBZ,
    LBZU,
    LHZ,
    LHZU,
    LHA,
    LD,
    LDU,
    LWZX,
    LBZX,
    LHZX,
    LDX,
    LMW,

    // Stores
    STW,
    STWU,
    STB,
    STBU,
    STH,
    STHU,
    STD,
    STDU,
    STWX,
    STBX,
    STHX,
    STDX,
    STMW,

    // Special purpose registers
    MFSPR,
    MTSPR,

    // Barriers and cache hints
    SYNC,
    EIEIO,
    ISYNC,
    DCBF,
    DCBT,

    // Unknown/unsupported
    Unknown,
}

impl Opcode {
    /// Is this a direct or indirect branch?
    pub fn is_branch(&self) -> bool {
        matches!(self, Opcode::B | Opcode::BC | Opcode::BCLR | Opcode::BCCTR)
    }

    /// Is this a system call?
    pub fn is_syscall(&self) -> bool {
        matches!(self, Opcode::SC)
    }

    /// Does this access guest memory?
    pub fn is_memory(&self) -> bool {
        matches!(
            self,
            Opcode::LWZ
                | Opcode::LWZU
                | Opcode::LBZ
                | Opcode::LBZU
                | Opcode::LHZ
                | Opcode::LHZU
                | Opcode::LHA
                | Opcode::LD
                | Opcode::LDU
                | Opcode::LWZX
                | Opcode::LBZX
                | Opcode::LHZX
                | Opcode::LDX
                | Opcode::LMW
                | Opcode::STW
                | Opcode::STWU
                | Opcode::STB
                | Opcode::STBU
                | Opcode::STH
                | Opcode::STHU
                | Opcode::STD
                | Opcode::STDU
                | Opcode::STWX
                | Opcode::STBX
                | Opcode::STHX
                | Opcode::STDX
                | Opcode::STMW
        )
    }
}

/// Special purpose register numbers used by the integer subset
pub mod spr {
    pub const XER: u32 = 1;
    pub const LR: u32 = 8;
    pub const CTR: u32 = 9;
}

impl Instruction {
    /// Primary opcode, bits 26-31
    pub fn primary(&self) -> u32 {
        self.code >> 26
    }

    /// Extended opcode of X/XL/XFX forms
    pub fn xo(&self) -> u32 {
        (self.code >> 1) & 0x3FF
    }

    /// RT / RS / BO / crbD field
    pub fn rt(&self) -> u8 {
        ((self.code >> 21) & 0x1F) as u8
    }

    pub fn rs(&self) -> u8 {
        self.rt()
    }

    /// RA / BI / crbA field
    pub fn ra(&self) -> u8 {
        ((self.code >> 16) & 0x1F) as u8
    }

    /// RB / crbB / SH field
    pub fn rb(&self) -> u8 {
        ((self.code >> 11) & 0x1F) as u8
    }

    /// Signed 16-bit immediate
    pub fn simm(&self) -> i64 {
        (self.code & 0xFFFF) as u16 as i16 as i64
    }

    /// Unsigned 16-bit immediate
    pub fn uimm(&self) -> u64 {
        (self.code & 0xFFFF) as u64
    }

    /// DS-form displacement (low two bits are the sub-opcode)
    pub fn ds(&self) -> i64 {
        (self.code & 0xFFFC) as u16 as i16 as i64
    }

    /// Record bit
    pub fn rc(&self) -> bool {
        self.code & 1 != 0
    }

    /// Link bit of branches
    pub fn lk(&self) -> bool {
        self.code & 1 != 0
    }

    /// Absolute-address bit of branches
    pub fn aa(&self) -> bool {
        self.code & 2 != 0
    }

    /// Branch options
    pub fn bo(&self) -> u8 {
        self.rt()
    }

    /// Condition register bit tested by a conditional branch
    pub fn bi(&self) -> u8 {
        self.ra()
    }

    /// Condition register field of compares and `mcrf`
    pub fn crfd(&self) -> u8 {
        ((self.code >> 23) & 0x7) as u8
    }

    /// Source condition register field of `mcrf`
    pub fn crfs(&self) -> u8 {
        ((self.code >> 18) & 0x7) as u8
    }

    /// Doubleword compare bit
    pub fn l(&self) -> bool {
        (self.code >> 21) & 1 != 0
    }

    /// Rotate mask begin of M-form
    pub fn mb(&self) -> u32 {
        (self.code >> 6) & 0x1F
    }

    /// Rotate mask end of M-form
    pub fn me(&self) -> u32 {
        (self.code >> 1) & 0x1F
    }

    /// 6-bit shift of MD-form
    pub fn sh64(&self) -> u32 {
        ((self.code >> 11) & 0x1F) | (((self.code >> 1) & 1) << 5)
    }

    /// 6-bit mask boundary of MD-form (stored rotated)
    pub fn mb64(&self) -> u32 {
        let raw = (self.code >> 5) & 0x3F;
        ((raw & 1) << 5) | (raw >> 1)
    }

    /// Special purpose register number (halves swapped in the encoding)
    pub fn spr(&self) -> u32 {
        ((self.code >> 16) & 0x1F) | (((self.code >> 11) & 0x1F) << 5)
    }

    /// Field mask of `mtcrf`
    pub fn crm(&self) -> u8 {
        ((self.code >> 12) & 0xFF) as u8
    }

    /// Is this an unconditional branch (BO ignores both CR and CTR)?
    pub fn is_unconditional(&self) -> bool {
        match self.opcode {
            Opcode::B => true,
            Opcode::BC | Opcode::BCLR | Opcode::BCCTR => self.bo() & 0x14 == 0x14,
            _ => false,
        }
    }

    /// Does this branch write the link register?
    pub fn is_call(&self) -> bool {
        self.opcode.is_branch() && self.lk()
    }

    /// Target of a direct branch
    pub fn branch_target(&self) -> Option<u32> {
        let offset = match self.opcode {
            Opcode::B => {
                // 26-bit LI field, sign extended
                ((self.code & 0x03FF_FFFC) as i32) << 6 >> 6
            }
            Opcode::BC => (self.code & 0xFFFC) as u16 as i16 as i32,
            _ => return None,
        };
        if self.aa() {
            Some(offset as u32)
        } else {
            Some(self.addr.wrapping_add(offset as u32))
        }
    }

    /// Does the guest treat this as an all-zero padding word?
    pub fn is_padding(&self) -> bool {
        self.code == 0
    }
}

/// Decode the instruction at a guest address
pub fn fetch(memory: &Memory, addr: u32) -> Result<Instruction, MemoryError> {
    Ok(decode(addr, memory.read_u32(addr)?))
}

/// Disassemble `[start, end)` into instructions
pub fn disassemble(memory: &Memory, start: u32, end: u32) -> Result<Vec<Instruction>, MemoryError> {
    (start..end).step_by(4).map(|addr| fetch(memory, addr)).collect()
}

/// Decode a 32-bit PowerPC instruction word
pub fn decode(addr: u32, code: u32) -> Instruction {
    let opcode = match code >> 26 {
        7 => Opcode::MULLI,
        8 => Opcode::SUBFIC,
        10 => Opcode::CMPLI,
        11 => Opcode::CMPI,
        12 => Opcode::ADDIC,
        13 => Opcode::ADDIC_,
        14 => Opcode::ADDI,
        15 => Opcode::ADDIS,
        16 => Opcode::BC,
        17 if code & 2 != 0 => Opcode::SC,
        18 => Opcode::B,
        19 => decode_xl(code),
        20 => Opcode::RLWIMI,
        21 => Opcode::RLWINM,
        23 => Opcode::RLWNM,
        24 => Opcode::ORI,
        25 => Opcode::ORIS,
        26 => Opcode::XORI,
        27 => Opcode::XORIS,
        28 => Opcode::ANDI_,
        29 => Opcode::ANDIS_,
        30 => match (code >> 2) & 0x7 {
            0 => Opcode::RLDICL,
            1 => Opcode::RLDICR,
            _ => Opcode::Unknown,
        },
        31 => decode_x(code),
        32 => Opcode::LWZ,
        33 => Opcode::LWZU,
        34 => Opcode::LBZ,
        35 => Opcode::LBZU,
        36 => Opcode::STW,
        37 => Opcode::STWU,
        38 => Opcode::STB,
        39 => Opcode::STBU,
        40 => Opcode::LHZ,
        41 => Opcode::LHZU,
        42 => Opcode::LHA,
        44 => Opcode::STH,
        45 => Opcode::STHU,
        46 => Opcode::LMW,
        47 => Opcode::STMW,
        58 => match code & 0x3 {
            0 => Opcode::LD,
            1 => Opcode::LDU,
            _ => Opcode::Unknown,
        },
        62 => match code & 0x3 {
            0 => Opcode::STD,
            1 => Opcode::STDU,
            _ => Opcode::Unknown,
        },
        _ => Opcode::Unknown,
    };

    Instruction { addr, code, opcode }
}

/// Primary opcode 19: branch-to-register and condition register logic
fn decode_xl(code: u32) -> Opcode {
    match (code >> 1) & 0x3FF {
        0 => Opcode::MCRF,
        16 => Opcode::BCLR,
        33 => Opcode::CRNOR,
        129 => Opcode::CRANDC,
        150 => Opcode::ISYNC,
        193 => Opcode::CRXOR,
        225 => Opcode::CRNAND,
        257 => Opcode::CRAND,
        289 => Opcode::CREQV,
        417 => Opcode::CRORC,
        449 => Opcode::CROR,
        528 => Opcode::BCCTR,
        _ => Opcode::Unknown,
    }
}

/// Primary opcode 31: X and XO forms
fn decode_x(code: u32) -> Opcode {
    let xo = (code >> 1) & 0x3FF;
    let x_form = match xo {
        0 => Some(Opcode::CMP),
        19 => Some(Opcode::MFCR),
        21 => Some(Opcode::LDX),
        23 => Some(Opcode::LWZX),
        24 => Some(Opcode::SLW),
        26 => Some(Opcode::CNTLZW),
        27 => Some(Opcode::SLD),
        28 => Some(Opcode::AND),
        32 => Some(Opcode::CMPL),
        54 => Some(Opcode::DCBF),
        58 => Some(Opcode::CNTLZD),
        60 => Some(Opcode::ANDC),
        86 => Some(Opcode::DCBF),
        87 => Some(Opcode::LBZX),
        124 => Some(Opcode::NOR),
        144 => Some(Opcode::MTCRF),
        149 => Some(Opcode::STDX),
        151 => Some(Opcode::STWX),
        215 => Some(Opcode::STBX),
        278 => Some(Opcode::DCBT),
        279 => Some(Opcode::LHZX),
        316 => Some(Opcode::XOR),
        339 => Some(Opcode::MFSPR),
        407 => Some(Opcode::STHX),
        444 => Some(Opcode::OR),
        467 => Some(Opcode::MTSPR),
        536 => Some(Opcode::SRW),
        539 => Some(Opcode::SRD),
        598 => Some(Opcode::SYNC),
        792 => Some(Opcode::SRAW),
        824 => Some(Opcode::SRAWI),
        854 => Some(Opcode::EIEIO),
        922 => Some(Opcode::EXTSH),
        954 => Some(Opcode::EXTSB),
        986 => Some(Opcode::EXTSW),
        _ => None,
    };
    if let Some(op) = x_form {
        return op;
    }

    // XO forms carry the OE bit above a 9-bit extended opcode
    match xo & 0x1FF {
        8 => Opcode::SUBFC,
        10 => Opcode::ADDC,
        11 => Opcode::MULHWU,
        40 => Opcode::SUBF,
        75 => Opcode::MULHW,
        104 => Opcode::NEG,
        136 => Opcode::SUBFE,
        138 => Opcode::ADDE,
        202 => Opcode::ADDZE,
        233 => Opcode::MULLD,
        235 => Opcode::MULLW,
        266 => Opcode::ADD,
        457 => Opcode::DIVDU,
        459 => Opcode::DIVWU,
        489 => Opcode::DIVD,
        491 => Opcode::DIVW,
        _ => Opcode::Unknown,
    }
}
