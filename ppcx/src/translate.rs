// translate.rs - PowerPC to host op lowering
//
// Each guest function becomes a flat list of `HostOp`s, one per guest
// instruction, so op index `i` is guest address `start + 4 * i`. Branches
// inside the function become op indices; everything else leaves the function
// through a call, a tail call or a return.
//
// The opcode -> lowering table is built once and never mutated afterwards;
// share it by reference between every compile.

use crate::backend::CompileError;
use crate::disasm::{fetch, spr, Instruction, Opcode};
use crate::memory::Memory;
use crate::symbol::FunctionSymbol;
use std::collections::HashMap;

/// Access width of a load or store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Half,
    Word,
    Double,
}

impl Width {
    pub fn bytes(self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Half => 2,
            Width::Word => 4,
            Width::Double => 8,
        }
    }
}

/// Second operand of compares and indexed memory forms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(u8),
    Imm(i64),
}

/// Register-register operations; `dst = a op b`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    AddCarrying,
    AddExtended,
    /// `b - a`
    SubFrom,
    SubFromCarrying,
    SubFromExtended,
    MulLowWord,
    MulHighWord,
    MulHighWordUnsigned,
    MulDouble,
    DivWord,
    DivWordUnsigned,
    DivDouble,
    DivDoubleUnsigned,
    And,
    AndComplement,
    Or,
    Nor,
    Xor,
    ShiftLeftWord,
    ShiftRightWord,
    ShiftRightAlgebraicWord,
    ShiftLeftDouble,
    ShiftRightDouble,
}

/// Register-immediate operations; `dst = a op imm`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmOp {
    Add,
    AddCarrying,
    /// `imm - a`
    SubFromCarrying,
    Mul,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    AddToZeroExtended,
    ExtendByte,
    ExtendHalf,
    ExtendWord,
    LeadingZerosWord,
    LeadingZerosDouble,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrOp {
    And,
    AndComplement,
    Equivalent,
    Nand,
    Nor,
    Or,
    OrComplement,
    Xor,
}

/// Special purpose registers the backend models
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spr {
    Xer,
    Lr,
    Ctr,
}

impl Spr {
    fn from_number(number: u32) -> Option<Self> {
        match number {
            spr::XER => Some(Spr::Xer),
            spr::LR => Some(Spr::Lr),
            spr::CTR => Some(Spr::Ctr),
            _ => None,
        }
    }
}

/// Rotate amount of the 32-bit rotate-and-mask family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shift {
    Imm(u32),
    Reg(u8),
}

/// BO/BI pair of a conditional branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Condition {
    pub bo: u8,
    pub bi: u8,
}

impl Condition {
    /// `None` when BO ignores both CTR and the condition register
    fn of(insn: &Instruction) -> Option<Self> {
        (!insn.is_unconditional()).then_some(Condition {
            bo: insn.bo(),
            bi: insn.bi(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchTarget {
    /// Op index inside the current function
    Local(usize),
    /// Leaves the function as a tail call
    Remote(u32),
}

/// One lowered guest instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOp {
    Nop,
    /// Full memory barrier
    Fence,
    LoadImm { dst: u8, value: u64 },
    Move { dst: u8, src: u8 },
    Imm { op: ImmOp, dst: u8, a: u8, imm: u64, record: bool },
    Alu { op: AluOp, dst: u8, a: u8, b: u8, record: bool },
    Unary { op: UnaryOp, dst: u8, a: u8, record: bool },
    ShiftRightAlgebraicImm { dst: u8, src: u8, amount: u32, record: bool },
    /// 32-bit rotate, mask applied to the doubled word
    Rotate32 { dst: u8, src: u8, shift: Shift, mask: u64, insert: bool, record: bool },
    Rotate64 { dst: u8, src: u8, shift: u32, mask: u64, record: bool },
    Compare { crf: u8, a: u8, b: Operand, signed: bool, wide: bool },
    Load { width: Width, signed: bool, dst: u8, base: Option<u8>, offset: Operand, update: bool },
    Store { width: Width, src: u8, base: Option<u8>, offset: Operand, update: bool },
    LoadMultiple { first: u8, base: Option<u8>, offset: i64 },
    StoreMultiple { first: u8, base: Option<u8>, offset: i64 },
    MoveFromSpr { dst: u8, spr: Spr },
    MoveToSpr { spr: Spr, src: u8 },
    MoveFromCr { dst: u8 },
    MoveToCrFields { src: u8, mask: u32 },
    CrLogic { op: CrOp, bt: u8, ba: u8, bb: u8 },
    MoveCrField { dst: u8, src: u8 },

    /// Unconditional jump inside the function
    Jump { target: usize },
    Branch { cond: Condition, target: BranchTarget },
    /// Direct call; LR receives the address of the next instruction
    Call { target: u32, cond: Option<Condition> },
    /// Call through LR or CTR
    CallIndirect { via: Spr, cond: Option<Condition> },
    TailCall { target: u32 },
    /// Branch through CTR without link (switch tables, tail calls)
    JumpIndirect { cond: Option<Condition> },
    Return { cond: Option<Condition> },
}

impl HostOp {
    /// Does this op transfer control?
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            HostOp::Jump { .. }
                | HostOp::Branch { .. }
                | HostOp::Call { .. }
                | HostOp::CallIndirect { .. }
                | HostOp::TailCall { .. }
                | HostOp::JumpIndirect { .. }
                | HostOp::Return { .. }
        )
    }
}

/// Address window of the function being lowered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub start: u32,
    pub end: u32,
}

impl Frame {
    /// Op index of `address` if it is an instruction of this function
    pub fn index_of(&self, address: u32) -> Option<usize> {
        (address >= self.start && address < self.end && address % 4 == 0)
            .then(|| ((address - self.start) / 4) as usize)
    }
}

/// A guest function in host op form
#[derive(Debug, Clone)]
pub struct LoweredFunction {
    pub address: u32,
    pub end_address: u32,
    pub ops: Vec<HostOp>,
}

impl LoweredFunction {
    pub fn frame(&self) -> Frame {
        Frame {
            start: self.address,
            end: self.end_address,
        }
    }
}

/// Per-opcode lowering; `None` means this encoding is not supported
pub type LowerFn = fn(&Instruction, &Frame) -> Option<HostOp>;

/// Immutable opcode -> lowering table
pub struct LoweringTable {
    handlers: HashMap<Opcode, LowerFn>,
}

impl Default for LoweringTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LoweringTable {
    pub fn new() -> Self {
        let mut table = Self {
            handlers: HashMap::new(),
        };
        table.register_arithmetic();
        table.register_logical();
        table.register_memory();
        table.register_condition_register();
        table.register_branches();
        table.register_system();
        table
    }

    fn register(&mut self, opcode: Opcode, lower: LowerFn) {
        self.handlers.insert(opcode, lower);
    }

    /// Number of opcodes with a lowering
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn lower(&self, insn: &Instruction, frame: &Frame) -> Option<HostOp> {
        let lower = self.handlers.get(&insn.opcode)?;
        lower(insn, frame)
    }

    /// Can `insn` be lowered wherever it appears?
    pub fn supports(&self, insn: &Instruction) -> bool {
        let frame = Frame {
            start: insn.addr,
            end: insn.addr.wrapping_add(4),
        };
        self.lower(insn, &frame).is_some()
    }

    fn register_arithmetic(&mut self) {
        self.register(Opcode::ADDI, |i, _| {
            Some(if i.ra() == 0 {
                HostOp::LoadImm { dst: i.rt(), value: i.simm() as u64 }
            } else {
                imm(i, ImmOp::Add, i.simm() as u64, false)
            })
        });
        self.register(Opcode::ADDIS, |i, _| {
            let value = (i.simm() << 16) as u64;
            Some(if i.ra() == 0 {
                HostOp::LoadImm { dst: i.rt(), value }
            } else {
                imm(i, ImmOp::Add, value, false)
            })
        });
        self.register(Opcode::ADDIC, |i, _| Some(imm(i, ImmOp::AddCarrying, i.simm() as u64, false)));
        self.register(Opcode::ADDIC_, |i, _| Some(imm(i, ImmOp::AddCarrying, i.simm() as u64, true)));
        self.register(Opcode::SUBFIC, |i, _| {
            Some(imm(i, ImmOp::SubFromCarrying, i.simm() as u64, false))
        });
        self.register(Opcode::MULLI, |i, _| Some(imm(i, ImmOp::Mul, i.simm() as u64, false)));

        self.register(Opcode::ADD, |i, _| Some(xo(i, AluOp::Add)));
        self.register(Opcode::ADDC, |i, _| Some(xo(i, AluOp::AddCarrying)));
        self.register(Opcode::ADDE, |i, _| Some(xo(i, AluOp::AddExtended)));
        self.register(Opcode::SUBF, |i, _| Some(xo(i, AluOp::SubFrom)));
        self.register(Opcode::SUBFC, |i, _| Some(xo(i, AluOp::SubFromCarrying)));
        self.register(Opcode::SUBFE, |i, _| Some(xo(i, AluOp::SubFromExtended)));
        self.register(Opcode::MULLW, |i, _| Some(xo(i, AluOp::MulLowWord)));
        self.register(Opcode::MULHW, |i, _| Some(xo(i, AluOp::MulHighWord)));
        self.register(Opcode::MULHWU, |i, _| Some(xo(i, AluOp::MulHighWordUnsigned)));
        self.register(Opcode::MULLD, |i, _| Some(xo(i, AluOp::MulDouble)));
        self.register(Opcode::DIVW, |i, _| Some(xo(i, AluOp::DivWord)));
        self.register(Opcode::DIVWU, |i, _| Some(xo(i, AluOp::DivWordUnsigned)));
        self.register(Opcode::DIVD, |i, _| Some(xo(i, AluOp::DivDouble)));
        self.register(Opcode::DIVDU, |i, _| Some(xo(i, AluOp::DivDoubleUnsigned)));

        self.register(Opcode::NEG, |i, _| {
            Some(HostOp::Unary { op: UnaryOp::Negate, dst: i.rt(), a: i.ra(), record: i.rc() })
        });
        self.register(Opcode::ADDZE, |i, _| {
            Some(HostOp::Unary {
                op: UnaryOp::AddToZeroExtended,
                dst: i.rt(),
                a: i.ra(),
                record: i.rc(),
            })
        });
    }

    fn register_logical(&mut self) {
        self.register(Opcode::ORI, |i, _| {
            if i.rs() == 0 && i.ra() == 0 && i.uimm() == 0 {
                return Some(HostOp::Nop);
            }
            Some(logical_imm(i, ImmOp::Or, i.uimm(), false))
        });
        self.register(Opcode::ORIS, |i, _| Some(logical_imm(i, ImmOp::Or, i.uimm() << 16, false)));
        self.register(Opcode::XORI, |i, _| Some(logical_imm(i, ImmOp::Xor, i.uimm(), false)));
        self.register(Opcode::XORIS, |i, _| {
            Some(logical_imm(i, ImmOp::Xor, i.uimm() << 16, false))
        });
        self.register(Opcode::ANDI_, |i, _| Some(logical_imm(i, ImmOp::And, i.uimm(), true)));
        self.register(Opcode::ANDIS_, |i, _| {
            Some(logical_imm(i, ImmOp::And, i.uimm() << 16, true))
        });

        self.register(Opcode::AND, |i, _| Some(x(i, AluOp::And)));
        self.register(Opcode::ANDC, |i, _| Some(x(i, AluOp::AndComplement)));
        self.register(Opcode::OR, |i, _| {
            // mr
            if i.rs() == i.rb() && !i.rc() {
                return Some(HostOp::Move { dst: i.ra(), src: i.rs() });
            }
            Some(x(i, AluOp::Or))
        });
        self.register(Opcode::NOR, |i, _| Some(x(i, AluOp::Nor)));
        self.register(Opcode::XOR, |i, _| Some(x(i, AluOp::Xor)));
        self.register(Opcode::SLW, |i, _| Some(x(i, AluOp::ShiftLeftWord)));
        self.register(Opcode::SRW, |i, _| Some(x(i, AluOp::ShiftRightWord)));
        self.register(Opcode::SRAW, |i, _| Some(x(i, AluOp::ShiftRightAlgebraicWord)));
        self.register(Opcode::SLD, |i, _| Some(x(i, AluOp::ShiftLeftDouble)));
        self.register(Opcode::SRD, |i, _| Some(x(i, AluOp::ShiftRightDouble)));
        self.register(Opcode::SRAWI, |i, _| {
            Some(HostOp::ShiftRightAlgebraicImm {
                dst: i.ra(),
                src: i.rs(),
                amount: i.rb() as u32,
                record: i.rc(),
            })
        });

        self.register(Opcode::EXTSB, |i, _| Some(unary_x(i, UnaryOp::ExtendByte)));
        self.register(Opcode::EXTSH, |i, _| Some(unary_x(i, UnaryOp::ExtendHalf)));
        self.register(Opcode::EXTSW, |i, _| Some(unary_x(i, UnaryOp::ExtendWord)));
        self.register(Opcode::CNTLZW, |i, _| Some(unary_x(i, UnaryOp::LeadingZerosWord)));
        self.register(Opcode::CNTLZD, |i, _| Some(unary_x(i, UnaryOp::LeadingZerosDouble)));

        self.register(Opcode::RLWINM, |i, _| Some(rotate32(i, Shift::Imm(i.rb() as u32), false)));
        self.register(Opcode::RLWNM, |i, _| Some(rotate32(i, Shift::Reg(i.rb()), false)));
        self.register(Opcode::RLWIMI, |i, _| Some(rotate32(i, Shift::Imm(i.rb() as u32), true)));
        self.register(Opcode::RLDICL, |i, _| {
            Some(HostOp::Rotate64 {
                dst: i.ra(),
                src: i.rs(),
                shift: i.sh64(),
                mask: mask64(i.mb64(), 63),
                record: i.rc(),
            })
        });
        self.register(Opcode::RLDICR, |i, _| {
            Some(HostOp::Rotate64 {
                dst: i.ra(),
                src: i.rs(),
                shift: i.sh64(),
                // The MD field holds ME for this form
                mask: mask64(0, i.mb64()),
                record: i.rc(),
            })
        });

        self.register(Opcode::CMP, |i, _| Some(compare(i, Operand::Reg(i.rb()), true)));
        self.register(Opcode::CMPL, |i, _| Some(compare(i, Operand::Reg(i.rb()), false)));
        self.register(Opcode::CMPI, |i, _| Some(compare(i, Operand::Imm(i.simm()), true)));
        self.register(Opcode::CMPLI, |i, _| {
            Some(compare(i, Operand::Imm(i.uimm() as i64), false))
        });
    }

    fn register_memory(&mut self) {
        self.register(Opcode::LBZ, |i, _| Some(load_d(i, Width::Byte, false, false)));
        self.register(Opcode::LBZU, |i, _| Some(load_d(i, Width::Byte, false, true)));
        self.register(Opcode::LHZ, |i, _| Some(load_d(i, Width::Half, false, false)));
        self.register(Opcode::LHZU, |i, _| Some(load_d(i, Width::Half, false, true)));
        self.register(Opcode::LHA, |i, _| Some(load_d(i, Width::Half, true, false)));
        self.register(Opcode::LWZ, |i, _| Some(load_d(i, Width::Word, false, false)));
        self.register(Opcode::LWZU, |i, _| Some(load_d(i, Width::Word, false, true)));
        self.register(Opcode::LD, |i, _| Some(load_ds(i, false)));
        self.register(Opcode::LDU, |i, _| Some(load_ds(i, true)));
        self.register(Opcode::LBZX, |i, _| Some(load_x(i, Width::Byte)));
        self.register(Opcode::LHZX, |i, _| Some(load_x(i, Width::Half)));
        self.register(Opcode::LWZX, |i, _| Some(load_x(i, Width::Word)));
        self.register(Opcode::LDX, |i, _| Some(load_x(i, Width::Double)));

        self.register(Opcode::STB, |i, _| Some(store_d(i, Width::Byte, false)));
        self.register(Opcode::STBU, |i, _| Some(store_d(i, Width::Byte, true)));
        self.register(Opcode::STH, |i, _| Some(store_d(i, Width::Half, false)));
        self.register(Opcode::STHU, |i, _| Some(store_d(i, Width::Half, true)));
        self.register(Opcode::STW, |i, _| Some(store_d(i, Width::Word, false)));
        self.register(Opcode::STWU, |i, _| Some(store_d(i, Width::Word, true)));
        self.register(Opcode::STD, |i, _| Some(store_ds(i, false)));
        self.register(Opcode::STDU, |i, _| Some(store_ds(i, true)));
        self.register(Opcode::STBX, |i, _| Some(store_x(i, Width::Byte)));
        self.register(Opcode::STHX, |i, _| Some(store_x(i, Width::Half)));
        self.register(Opcode::STWX, |i, _| Some(store_x(i, Width::Word)));
        self.register(Opcode::STDX, |i, _| Some(store_x(i, Width::Double)));

        self.register(Opcode::LMW, |i, _| {
            Some(HostOp::LoadMultiple { first: i.rt(), base: base(i), offset: i.simm() })
        });
        self.register(Opcode::STMW, |i, _| {
            Some(HostOp::StoreMultiple { first: i.rs(), base: base(i), offset: i.simm() })
        });
    }

    fn register_condition_register(&mut self) {
        self.register(Opcode::CRAND, |i, _| Some(cr_logic(i, CrOp::And)));
        self.register(Opcode::CRANDC, |i, _| Some(cr_logic(i, CrOp::AndComplement)));
        self.register(Opcode::CREQV, |i, _| Some(cr_logic(i, CrOp::Equivalent)));
        self.register(Opcode::CRNAND, |i, _| Some(cr_logic(i, CrOp::Nand)));
        self.register(Opcode::CRNOR, |i, _| Some(cr_logic(i, CrOp::Nor)));
        self.register(Opcode::CROR, |i, _| Some(cr_logic(i, CrOp::Or)));
        self.register(Opcode::CRORC, |i, _| Some(cr_logic(i, CrOp::OrComplement)));
        self.register(Opcode::CRXOR, |i, _| Some(cr_logic(i, CrOp::Xor)));
        self.register(Opcode::MCRF, |i, _| {
            Some(HostOp::MoveCrField { dst: i.crfd(), src: i.crfs() })
        });
        self.register(Opcode::MFCR, |i, _| Some(HostOp::MoveFromCr { dst: i.rt() }));
        self.register(Opcode::MTCRF, |i, _| {
            Some(HostOp::MoveToCrFields { src: i.rs(), mask: field_mask(i.crm()) })
        });
    }

    fn register_branches(&mut self) {
        self.register(Opcode::B, lower_direct_branch);
        self.register(Opcode::BC, lower_direct_branch);
        self.register(Opcode::BCLR, |i, _| {
            let cond = Condition::of(i);
            Some(if i.lk() {
                HostOp::CallIndirect { via: Spr::Lr, cond }
            } else {
                HostOp::Return { cond }
            })
        });
        self.register(Opcode::BCCTR, |i, _| {
            let cond = Condition::of(i);
            Some(if i.lk() {
                HostOp::CallIndirect { via: Spr::Ctr, cond }
            } else {
                HostOp::JumpIndirect { cond }
            })
        });
    }

    fn register_system(&mut self) {
        self.register(Opcode::MFSPR, |i, _| {
            Spr::from_number(i.spr()).map(|spr| HostOp::MoveFromSpr { dst: i.rt(), spr })
        });
        self.register(Opcode::MTSPR, |i, _| {
            Spr::from_number(i.spr()).map(|spr| HostOp::MoveToSpr { spr, src: i.rs() })
        });
        self.register(Opcode::SYNC, |_, _| Some(HostOp::Fence));
        self.register(Opcode::EIEIO, |_, _| Some(HostOp::Fence));
        self.register(Opcode::ISYNC, |_, _| Some(HostOp::Fence));
        // Cache hints have no architectural effect on a flat image
        self.register(Opcode::DCBF, |_, _| Some(HostOp::Nop));
        self.register(Opcode::DCBT, |_, _| Some(HostOp::Nop));
    }
}

fn imm(i: &Instruction, op: ImmOp, value: u64, record: bool) -> HostOp {
    HostOp::Imm { op, dst: i.rt(), a: i.ra(), imm: value, record }
}

/// D-form logicals write RA from RS
fn logical_imm(i: &Instruction, op: ImmOp, value: u64, record: bool) -> HostOp {
    HostOp::Imm { op, dst: i.ra(), a: i.rs(), imm: value, record }
}

/// XO form: `rt = ra op rb`
fn xo(i: &Instruction, op: AluOp) -> HostOp {
    HostOp::Alu { op, dst: i.rt(), a: i.ra(), b: i.rb(), record: i.rc() }
}

/// X form logicals and shifts: `ra = rs op rb`
fn x(i: &Instruction, op: AluOp) -> HostOp {
    HostOp::Alu { op, dst: i.ra(), a: i.rs(), b: i.rb(), record: i.rc() }
}

fn unary_x(i: &Instruction, op: UnaryOp) -> HostOp {
    HostOp::Unary { op, dst: i.ra(), a: i.rs(), record: i.rc() }
}

fn rotate32(i: &Instruction, shift: Shift, insert: bool) -> HostOp {
    HostOp::Rotate32 {
        dst: i.ra(),
        src: i.rs(),
        shift,
        mask: mask64(i.mb() + 32, i.me() + 32),
        insert,
        record: i.rc(),
    }
}

fn compare(i: &Instruction, b: Operand, signed: bool) -> HostOp {
    HostOp::Compare { crf: i.crfd(), a: i.ra(), b, signed, wide: i.l() }
}

/// RA = 0 means a literal zero base
fn base(i: &Instruction) -> Option<u8> {
    (i.ra() != 0).then_some(i.ra())
}

/// Update forms always use RA as the base, even r0
fn update_base(i: &Instruction, update: bool) -> Option<u8> {
    if update {
        Some(i.ra())
    } else {
        base(i)
    }
}

fn load_d(i: &Instruction, width: Width, signed: bool, update: bool) -> HostOp {
    HostOp::Load {
        width,
        signed,
        dst: i.rt(),
        base: update_base(i, update),
        offset: Operand::Imm(i.simm()),
        update,
    }
}

fn load_ds(i: &Instruction, update: bool) -> HostOp {
    HostOp::Load {
        width: Width::Double,
        signed: false,
        dst: i.rt(),
        base: update_base(i, update),
        offset: Operand::Imm(i.ds()),
        update,
    }
}

fn load_x(i: &Instruction, width: Width) -> HostOp {
    HostOp::Load {
        width,
        signed: false,
        dst: i.rt(),
        base: base(i),
        offset: Operand::Reg(i.rb()),
        update: false,
    }
}

fn store_d(i: &Instruction, width: Width, update: bool) -> HostOp {
    HostOp::Store {
        width,
        src: i.rs(),
        base: update_base(i, update),
        offset: Operand::Imm(i.simm()),
        update,
    }
}

fn store_ds(i: &Instruction, update: bool) -> HostOp {
    HostOp::Store {
        width: Width::Double,
        src: i.rs(),
        base: update_base(i, update),
        offset: Operand::Imm(i.ds()),
        update,
    }
}

fn store_x(i: &Instruction, width: Width) -> HostOp {
    HostOp::Store {
        width,
        src: i.rs(),
        base: base(i),
        offset: Operand::Reg(i.rb()),
        update: false,
    }
}

fn cr_logic(i: &Instruction, op: CrOp) -> HostOp {
    HostOp::CrLogic { op, bt: i.rt(), ba: i.ra(), bb: i.rb() }
}

/// Expand an 8-bit CRM field mask to the CR bits it selects
fn field_mask(crm: u8) -> u32 {
    (0..8)
        .filter(|field| crm & (0x80 >> field) != 0)
        .fold(0, |mask, field| mask | (0xF000_0000 >> (field * 4)))
}

/// Mask with bits `mb..=me` set, numbered MSB-0 over 64 bits; wraps when
/// `mb > me`
pub fn mask64(mb: u32, me: u32) -> u64 {
    let begin = u64::MAX >> mb;
    let end = u64::MAX << (63 - me);
    if mb <= me {
        begin & end
    } else {
        begin | end
    }
}

fn lower_direct_branch(i: &Instruction, frame: &Frame) -> Option<HostOp> {
    let target = i.branch_target()?;
    let cond = Condition::of(i);
    if i.lk() {
        return Some(HostOp::Call { target, cond });
    }
    Some(match (cond, frame.index_of(target)) {
        (None, Some(index)) => HostOp::Jump { target: index },
        (None, None) => HostOp::TailCall { target },
        (Some(cond), Some(index)) => HostOp::Branch { cond, target: BranchTarget::Local(index) },
        (Some(cond), None) => HostOp::Branch { cond, target: BranchTarget::Remote(target) },
    })
}

/// Lower every instruction of a defined function
pub fn lower_function(
    memory: &Memory,
    symbol: &FunctionSymbol,
    table: &LoweringTable,
) -> Result<LoweredFunction, CompileError> {
    let address = symbol.address();
    let end_address = symbol
        .end_address()
        .ok_or(CompileError::NotDefined { address })?;
    let frame = Frame {
        start: address,
        end: end_address,
    };

    let mut ops = Vec::with_capacity(((end_address - address) / 4) as usize);
    for addr in (address..end_address).step_by(4) {
        let insn = fetch(memory, addr)?;
        let op = table
            .lower(&insn, &frame)
            .ok_or(CompileError::Unimplemented {
                address: addr,
                code: insn.code,
            })?;
        ops.push(op);
    }

    Ok(LoweredFunction {
        address,
        end_address,
        ops,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm;
    use crate::disasm::decode;

    fn frame() -> Frame {
        Frame {
            start: 0x1000,
            end: 0x1020,
        }
    }

    fn lower(addr: u32, code: u32) -> Option<HostOp> {
        LoweringTable::new().lower(&decode(addr, code), &frame())
    }

    #[test]
    fn test_mask64() {
        assert_eq!(mask64(0, 63), u64::MAX);
        assert_eq!(mask64(32, 63), 0xFFFF_FFFF);
        assert_eq!(mask64(63, 63), 1);
        assert_eq!(mask64(0, 0), 1 << 63);
        // Wrapping mask
        assert_eq!(mask64(63, 0), (1 << 63) | 1);
    }

    #[test]
    fn test_field_mask() {
        assert_eq!(field_mask(0x80), 0xF000_0000);
        assert_eq!(field_mask(0x01), 0x0000_000F);
        assert_eq!(field_mask(0xFF), 0xFFFF_FFFF);
    }

    #[test]
    fn test_immediate_forms() {
        assert_eq!(
            lower(0x1000, asm::li(3, -1)),
            Some(HostOp::LoadImm { dst: 3, value: u64::MAX })
        );
        assert_eq!(
            lower(0x1000, asm::lis(3, 1)),
            Some(HostOp::LoadImm { dst: 3, value: 0x1_0000 })
        );
        assert_eq!(lower(0x1000, asm::nop()), Some(HostOp::Nop));
        assert_eq!(
            lower(0x1000, asm::ori(4, 3, 0x40)),
            Some(HostOp::Imm { op: ImmOp::Or, dst: 4, a: 3, imm: 0x40, record: false })
        );
        assert_eq!(lower(0x1000, asm::mr(3, 4)), Some(HostOp::Move { dst: 3, src: 4 }));
    }

    #[test]
    fn test_branches_inside_and_outside() {
        assert_eq!(lower(0x1004, asm::b(8)), Some(HostOp::Jump { target: 3 }));
        assert_eq!(lower(0x1004, asm::b(0x100)), Some(HostOp::TailCall { target: 0x1104 }));
        assert_eq!(
            lower(0x1004, asm::bl(0x100)),
            Some(HostOp::Call { target: 0x1104, cond: None })
        );
        assert_eq!(
            lower(0x1000, asm::beq(0, 8)),
            Some(HostOp::Branch {
                cond: Condition { bo: 12, bi: 2 },
                target: BranchTarget::Local(2)
            })
        );
        assert_eq!(lower(0x1000, asm::blr()), Some(HostOp::Return { cond: None }));
        assert_eq!(lower(0x1000, asm::bctr()), Some(HostOp::JumpIndirect { cond: None }));
        assert_eq!(
            lower(0x1000, asm::bctrl()),
            Some(HostOp::CallIndirect { via: Spr::Ctr, cond: None })
        );
    }

    #[test]
    fn test_memory_forms() {
        assert_eq!(
            lower(0x1000, asm::lwz(3, 8, 1)),
            Some(HostOp::Load {
                width: Width::Word,
                signed: false,
                dst: 3,
                base: Some(1),
                offset: Operand::Imm(8),
                update: false
            })
        );
        assert_eq!(
            lower(0x1000, asm::stwu(1, -16, 1)),
            Some(HostOp::Store {
                width: Width::Word,
                src: 1,
                base: Some(1),
                offset: Operand::Imm(-16),
                update: true
            })
        );
        // RA = 0 is a literal zero
        assert!(matches!(
            lower(0x1000, asm::lbz(3, 0x10, 0)),
            Some(HostOp::Load { base: None, .. })
        ));
    }

    #[test]
    fn test_unsupported() {
        let table = LoweringTable::new();
        assert!(!table.supports(&decode(0, asm::sc())));
        assert!(!table.supports(&decode(0, 0)));
        // Time base is not modelled
        assert!(!table.supports(&decode(0, asm::mfspr(3, 268))));
        assert!(table.supports(&decode(0, asm::mflr(0))));
        assert!(table.supports(&decode(0, asm::blr())));
    }
}
