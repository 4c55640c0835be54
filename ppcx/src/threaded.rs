// threaded.rs - Threaded-code backend
//
// Compiles a guest function into a flat `HostOp` list and runs it with a
// dispatch loop over the thread's register file. Guest calls nest on the host
// stack: every call records the return address it installed in LR, and the
// callee's `blr` must come back to exactly that address. Jumps between
// functions do not nest.

use crate::backend::{
    Backend, BackendError, CodeHandle, CompileError, ExecError, FunctionResolver, HostEntry,
    InstructionSupport, RegisterHooks,
};
use crate::config::BackendConfig;
use crate::disasm::Instruction;
use crate::memory::Memory;
use crate::symbol::{FunctionFlags, FunctionStatus, FunctionSymbol};
use crate::thread_state::{cr, xer, PpcState, ThreadState};
use crate::translate::{
    lower_function, AluOp, BranchTarget, Condition, CrOp, HostOp, ImmOp, LoweredFunction,
    LoweringTable, Operand, Shift, Spr, UnaryOp, Width,
};
use dashmap::DashMap;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{fence, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, trace};

/// Compile and release counters
#[derive(Debug, Default)]
pub struct BackendStats {
    compiled: AtomicUsize,
    released: AtomicUsize,
}

impl BackendStats {
    pub fn compiled(&self) -> usize {
        self.compiled.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }

    /// Compiled functions still held by the arena
    pub fn live(&self) -> usize {
        self.compiled().saturating_sub(self.released())
    }
}

/// Threaded-code backend
pub struct ThreadedBackend {
    config: BackendConfig,
    table: Arc<LoweringTable>,
    stats: Arc<BackendStats>,
    engine: Option<Arc<Engine>>,
    pending_hooks: Option<Arc<dyn RegisterHooks>>,
}

impl ThreadedBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self::with_table(config, Arc::new(LoweringTable::new()))
    }

    /// Share an already built lowering table
    pub fn with_table(config: BackendConfig, table: Arc<LoweringTable>) -> Self {
        Self {
            config,
            table,
            stats: Arc::new(BackendStats::default()),
            engine: None,
            pending_hooks: None,
        }
    }

    pub fn stats(&self) -> Arc<BackendStats> {
        self.stats.clone()
    }

    fn engine(&self) -> Option<&Arc<Engine>> {
        self.engine.as_ref()
    }
}

impl Default for ThreadedBackend {
    fn default() -> Self {
        Self::new(BackendConfig::default())
    }
}

impl InstructionSupport for ThreadedBackend {
    fn supports(&self, insn: &Instruction) -> bool {
        self.table.supports(insn)
    }
}

impl Backend for ThreadedBackend {
    fn name(&self) -> &'static str {
        "threaded"
    }

    fn setup(&mut self, memory: Arc<Memory>) -> Result<(), BackendError> {
        if self.engine.is_some() {
            return Err(BackendError::Setup("already set up".to_string()));
        }
        if self.config.max_call_depth == 0 || self.config.arena_capacity == 0 {
            return Err(BackendError::Setup(format!(
                "unusable configuration {:?}",
                self.config
            )));
        }

        let engine = Engine {
            config: self.config.clone(),
            memory,
            hooks: OnceLock::new(),
            arena: DashMap::new(),
            reserved: AtomicUsize::new(0),
            next_handle: AtomicU32::new(1),
        };
        if let Some(hooks) = self.pending_hooks.take() {
            let _ = engine.hooks.set(hooks);
        }
        self.engine = Some(Arc::new(engine));
        debug!("{} backend ready ({} lowerings)", self.name(), self.table.len());
        Ok(())
    }

    fn set_register_hooks(&mut self, hooks: Arc<dyn RegisterHooks>) -> Result<(), BackendError> {
        match &self.engine {
            Some(engine) => engine
                .hooks
                .set(hooks)
                .map_err(|_| BackendError::Setup("register hooks already installed".to_string())),
            None => {
                self.pending_hooks = Some(hooks);
                Ok(())
            }
        }
    }

    fn compile_symbol(&self, symbol: &FunctionSymbol) -> Result<CodeHandle, CompileError> {
        let engine = self.engine().ok_or(CompileError::NotSetUp)?;
        if symbol.flags().contains(FunctionFlags::EXTERN) {
            return Err(CompileError::Extern {
                address: symbol.address(),
            });
        }

        // Claim an arena slot before lowering so concurrent compiles of
        // different functions cannot overshoot the capacity
        let capacity = engine.config.arena_capacity;
        engine
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < capacity).then_some(live + 1)
            })
            .map_err(|_| CompileError::ArenaExhausted { capacity })?;

        let lowered = match lower_function(&engine.memory, symbol, &self.table) {
            Ok(lowered) => lowered,
            Err(err) => {
                engine.reserved.fetch_sub(1, Ordering::AcqRel);
                return Err(err);
            }
        };
        let handle = engine.next_handle.fetch_add(1, Ordering::Relaxed);
        trace!(
            "compiled {} into {} ops (handle {})",
            symbol.name(),
            lowered.ops.len(),
            handle
        );
        engine.arena.insert(handle, Arc::new(lowered));
        self.stats.compiled.fetch_add(1, Ordering::Relaxed);
        Ok(CodeHandle::new(handle))
    }

    fn release(&self, handle: CodeHandle) {
        if let Some(engine) = self.engine() {
            if engine.arena.remove(&handle.raw()).is_some() {
                engine.reserved.fetch_sub(1, Ordering::AcqRel);
                self.stats.released.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn execute(
        &self,
        state: &mut ThreadState,
        entry: &FunctionSymbol,
        address: u32,
        resolver: &dyn FunctionResolver,
    ) -> Result<(), ExecError> {
        let engine = self.engine().ok_or(ExecError::NotSetUp)?;
        let return_address = state.ppc.lr as u32;
        engine.invoke(state, entry, address, resolver, return_address, 0)
    }

    fn get_function_pointer(&self, symbol: &FunctionSymbol, address: u32) -> Option<HostEntry> {
        let engine = self.engine()?.clone();
        let code = engine.code(symbol.code_handle()?)?;
        let start = code.frame().index_of(address)?;
        let entry: HostEntry = Arc::new(
            move |state: &mut ThreadState, resolver: &dyn FunctionResolver| {
                let return_address = state.ppc.lr as u32;
                engine.run_from(code.clone(), start, state, resolver, return_address, 0)
            },
        );
        Some(entry)
    }
}

/// State shared by every execution once the backend is set up
struct Engine {
    config: BackendConfig,
    memory: Arc<Memory>,
    hooks: OnceLock<Arc<dyn RegisterHooks>>,
    arena: DashMap<u32, Arc<LoweredFunction>>,
    /// Arena slots in use or claimed by a compile in progress
    reserved: AtomicUsize,
    next_handle: AtomicU32,
}

impl Engine {
    fn code(&self, handle: CodeHandle) -> Option<Arc<LoweredFunction>> {
        self.arena.get(&handle.raw()).map(|entry| entry.value().clone())
    }

    /// Compiled code of `symbol` and the op index of `address` inside it.
    /// `None` for an extern, which has no code.
    fn locate(
        &self,
        symbol: &FunctionSymbol,
        address: u32,
    ) -> Result<Option<(Arc<LoweredFunction>, usize)>, ExecError> {
        let entry = symbol.address();
        let flags = symbol.flags();
        if flags.contains(FunctionFlags::EXTERN) {
            return Ok(None);
        }
        match symbol.status() {
            FunctionStatus::Defined => {}
            FunctionStatus::Failed => return Err(ExecError::AnalysisFailed { address: entry }),
            FunctionStatus::Declared | FunctionStatus::Analyzing => {
                return Err(ExecError::MissingCode { address: entry })
            }
        }
        if flags.contains(FunctionFlags::UNIMPLEMENTED) {
            return Err(ExecError::Unimplemented { address: entry });
        }

        let code = match symbol.code_handle().and_then(|handle| self.code(handle)) {
            Some(code) => code,
            None => {
                return Err(match symbol.compile_error() {
                    Some(source) => ExecError::CompileFailed {
                        address: entry,
                        source,
                    },
                    None => ExecError::MissingCode { address: entry },
                })
            }
        };
        let index = code
            .frame()
            .index_of(address)
            .ok_or(ExecError::NotAFunction { address })?;
        Ok(Some((code, index)))
    }

    /// Enter `symbol` at `address` one call level deeper than the caller;
    /// returns once it has returned to `return_address`
    fn invoke(
        &self,
        state: &mut ThreadState,
        symbol: &FunctionSymbol,
        address: u32,
        resolver: &dyn FunctionResolver,
        return_address: u32,
        depth: usize,
    ) -> Result<(), ExecError> {
        if depth >= self.config.max_call_depth {
            return Err(ExecError::CallDepthExceeded {
                limit: self.config.max_call_depth,
            });
        }
        match self.locate(symbol, address)? {
            Some((code, index)) => {
                self.run_from(code, index, state, resolver, return_address, depth)
            }
            None => resolver.call_extern(symbol, state),
        }
    }

    /// Where a jump that leaves the current function lands. An extern
    /// target runs right away and `None` comes back: it returns on behalf
    /// of the function that jumped to it.
    fn tail(
        &self,
        target: u32,
        state: &mut ThreadState,
        resolver: &dyn FunctionResolver,
    ) -> Result<Option<(Arc<LoweredFunction>, usize)>, ExecError> {
        let callee = resolver.resolve(target)?;
        match self.locate(&callee, target)? {
            Some(landing) => Ok(Some(landing)),
            None => {
                resolver.call_extern(&callee, state)?;
                Ok(None)
            }
        }
    }

    /// Run from op `start` until the code returns to `return_address`.
    ///
    /// Jumps to other functions replace the running code in place; only
    /// calls nest on the host stack.
    fn run_from(
        &self,
        code: Arc<LoweredFunction>,
        start: usize,
        state: &mut ThreadState,
        resolver: &dyn FunctionResolver,
        return_address: u32,
        depth: usize,
    ) -> Result<(), ExecError> {
        let mut code = code;
        let mut index = start;
        loop {
            let Some(op) = code.ops.get(index).copied() else {
                // Fell off the end into whatever follows
                match self.tail(code.end_address, state, resolver)? {
                    Some((next, at)) => {
                        code = next;
                        index = at;
                        continue;
                    }
                    None => return Ok(()),
                }
            };
            let pc = code.address.wrapping_add(index as u32 * 4);
            state.ppc.cia = pc;
            index += 1;

            // Target of a jump out of the current function, if one is taken
            let mut leave = None;
            match op {
                HostOp::Nop => {}
                HostOp::Fence => fence(Ordering::SeqCst),
                HostOp::LoadImm { dst, value } => state.ppc.r[dst as usize] = value,
                HostOp::Move { dst, src } => state.ppc.r[dst as usize] = state.ppc.r[src as usize],
                HostOp::Imm { op, dst, a, imm, record } => {
                    let a = state.ppc.r[a as usize];
                    let value = imm_op(&mut state.ppc, op, a, imm);
                    write_result(&mut state.ppc, dst, value, record);
                }
                HostOp::Alu { op, dst, a, b, record } => {
                    let (a, b) = (state.ppc.r[a as usize], state.ppc.r[b as usize]);
                    let value = alu_op(&mut state.ppc, op, a, b);
                    write_result(&mut state.ppc, dst, value, record);
                }
                HostOp::Unary { op, dst, a, record } => {
                    let a = state.ppc.r[a as usize];
                    let value = unary_op(&mut state.ppc, op, a);
                    write_result(&mut state.ppc, dst, value, record);
                }
                HostOp::ShiftRightAlgebraicImm { dst, src, amount, record } => {
                    let src = state.ppc.r[src as usize];
                    let value = shift_right_algebraic_word(&mut state.ppc, src, amount);
                    write_result(&mut state.ppc, dst, value, record);
                }
                HostOp::Rotate32 { dst, src, shift, mask, insert, record } => {
                    let amount = match shift {
                        Shift::Imm(n) => n,
                        Shift::Reg(r) => (state.ppc.r[r as usize] & 0x1F) as u32,
                    };
                    let word = (state.ppc.r[src as usize] as u32).rotate_left(amount) as u64;
                    let mut value = (word | (word << 32)) & mask;
                    if insert {
                        value |= state.ppc.r[dst as usize] & !mask;
                    }
                    write_result(&mut state.ppc, dst, value, record);
                }
                HostOp::Rotate64 { dst, src, shift, mask, record } => {
                    let value = state.ppc.r[src as usize].rotate_left(shift) & mask;
                    write_result(&mut state.ppc, dst, value, record);
                }
                HostOp::Compare { crf, a, b, signed, wide } => {
                    let a = state.ppc.r[a as usize];
                    let b = match b {
                        Operand::Reg(r) => state.ppc.r[r as usize],
                        Operand::Imm(value) => value as u64,
                    };
                    compare(&mut state.ppc, crf, a, b, signed, wide);
                }
                HostOp::Load { width, signed, dst, base, offset, update } => {
                    let ea = effective_address(&state.ppc, base, offset);
                    let value = self.load(width, ea, pc)?;
                    state.ppc.r[dst as usize] = if signed { sign_extend(value, width) } else { value };
                    if let (true, Some(base)) = (update, base) {
                        state.ppc.r[base as usize] = ea as u64;
                    }
                }
                HostOp::Store { width, src, base, offset, update } => {
                    let ea = effective_address(&state.ppc, base, offset);
                    self.store(width, ea, state.ppc.r[src as usize], pc)?;
                    if let (true, Some(base)) = (update, base) {
                        state.ppc.r[base as usize] = ea as u64;
                    }
                }
                HostOp::LoadMultiple { first, base, offset } => {
                    let mut ea = effective_address(&state.ppc, base, Operand::Imm(offset));
                    for r in first as usize..32 {
                        state.ppc.r[r] = self.load(Width::Word, ea, pc)?;
                        ea = ea.wrapping_add(4);
                    }
                }
                HostOp::StoreMultiple { first, base, offset } => {
                    let mut ea = effective_address(&state.ppc, base, Operand::Imm(offset));
                    for r in first as usize..32 {
                        self.store(Width::Word, ea, state.ppc.r[r], pc)?;
                        ea = ea.wrapping_add(4);
                    }
                }
                HostOp::MoveFromSpr { dst, spr } => {
                    state.ppc.r[dst as usize] = match spr {
                        Spr::Xer => state.ppc.xer as u64,
                        Spr::Lr => state.ppc.lr,
                        Spr::Ctr => state.ppc.ctr,
                    };
                }
                HostOp::MoveToSpr { spr, src } => {
                    let value = state.ppc.r[src as usize];
                    match spr {
                        Spr::Xer => state.ppc.xer = value as u32,
                        Spr::Lr => state.ppc.lr = value,
                        Spr::Ctr => state.ppc.ctr = value,
                    }
                }
                HostOp::MoveFromCr { dst } => state.ppc.r[dst as usize] = state.ppc.cr as u64,
                HostOp::MoveToCrFields { src, mask } => {
                    let value = state.ppc.r[src as usize] as u32;
                    state.ppc.cr = (state.ppc.cr & !mask) | (value & mask);
                }
                HostOp::CrLogic { op, bt, ba, bb } => {
                    let (a, b) = (state.ppc.cr_bit(ba), state.ppc.cr_bit(bb));
                    let value = match op {
                        CrOp::And => a & b,
                        CrOp::AndComplement => a & !b,
                        CrOp::Equivalent => a == b,
                        CrOp::Nand => !(a & b),
                        CrOp::Nor => !(a | b),
                        CrOp::Or => a | b,
                        CrOp::OrComplement => a | !b,
                        CrOp::Xor => a ^ b,
                    };
                    state.ppc.set_cr_bit(bt, value);
                }
                HostOp::MoveCrField { dst, src } => {
                    let bits = state.ppc.cr_field(src);
                    state.ppc.set_cr_field(dst, bits);
                }

                HostOp::Jump { target } => index = target,
                HostOp::Branch { cond, target } => {
                    if branch_taken(&mut state.ppc, Some(cond)) {
                        match target {
                            BranchTarget::Local(target) => index = target,
                            BranchTarget::Remote(address) => leave = Some(address),
                        }
                    }
                }
                HostOp::Call { target, cond } => {
                    if branch_taken(&mut state.ppc, cond) {
                        self.call(target, pc, state, resolver, depth)?;
                    }
                }
                HostOp::CallIndirect { via, cond } => {
                    if branch_taken(&mut state.ppc, cond) {
                        let target = match via {
                            Spr::Ctr => state.ppc.ctr,
                            _ => state.ppc.lr,
                        };
                        self.call(target as u32, pc, state, resolver, depth)?;
                    }
                }
                HostOp::TailCall { target } => leave = Some(target),
                HostOp::JumpIndirect { cond } => {
                    if branch_taken(&mut state.ppc, cond) {
                        let target = state.ppc.ctr as u32;
                        match code.frame().index_of(target) {
                            Some(local) => index = local,
                            None => leave = Some(target),
                        }
                    }
                }
                HostOp::Return { cond } => {
                    if branch_taken(&mut state.ppc, cond) {
                        let found = state.ppc.lr as u32;
                        if found != return_address {
                            return Err(ExecError::UnbalancedReturn {
                                pc,
                                expected: return_address,
                                found,
                            });
                        }
                        return Ok(());
                    }
                }
            }

            if let Some(target) = leave {
                match self.tail(target, state, resolver)? {
                    Some((next, at)) => {
                        code = next;
                        index = at;
                    }
                    None => return Ok(()),
                }
            }
        }
    }

    /// Guest call from `pc`: LR gets the return address, the callee must
    /// come back to it
    fn call(
        &self,
        target: u32,
        pc: u32,
        state: &mut ThreadState,
        resolver: &dyn FunctionResolver,
        depth: usize,
    ) -> Result<(), ExecError> {
        let return_address = pc.wrapping_add(4);
        state.ppc.lr = return_address as u64;
        let callee = resolver.resolve(target)?;
        self.invoke(state, &callee, target, resolver, return_address, depth + 1)
    }

    fn hardware_index(&self, ea: u32) -> Option<u32> {
        let range = &self.config.hardware_range;
        range.contains(&ea).then(|| (ea - range.start) / 4)
    }

    fn load(&self, width: Width, ea: u32, pc: u32) -> Result<u64, ExecError> {
        if let Some(index) = self.hardware_index(ea) {
            let hooks = self
                .hooks
                .get()
                .ok_or(ExecError::MemoryFault { address: ea, pc })?;
            return Ok(hooks.read_register(index));
        }

        let memory = &self.memory;
        let value = match width {
            Width::Byte => memory.read_u8(ea).map(u64::from),
            Width::Half => memory.read_u16(ea).map(u64::from),
            Width::Word => memory.read_u32(ea).map(u64::from),
            Width::Double => memory.read_u64(ea),
        };
        value.map_err(|_| ExecError::MemoryFault { address: ea, pc })
    }

    fn store(&self, width: Width, ea: u32, value: u64, pc: u32) -> Result<(), ExecError> {
        if let Some(index) = self.hardware_index(ea) {
            let hooks = self
                .hooks
                .get()
                .ok_or(ExecError::MemoryFault { address: ea, pc })?;
            hooks.write_register(index, value);
            return Ok(());
        }

        let memory = &self.memory;
        let result = match width {
            Width::Byte => memory.write_u8(ea, value as u8),
            Width::Half => memory.write_u16(ea, value as u16),
            Width::Word => memory.write_u32(ea, value as u32),
            Width::Double => memory.write_u64(ea, value),
        };
        result.map_err(|_| ExecError::MemoryFault { address: ea, pc })
    }
}

fn write_result(ppc: &mut PpcState, dst: u8, value: u64, record: bool) {
    ppc.r[dst as usize] = value;
    if record {
        ppc.record(value);
    }
}

/// Guest effective addresses wrap at 32 bits
fn effective_address(ppc: &PpcState, base: Option<u8>, offset: Operand) -> u32 {
    let base = base.map_or(0, |r| ppc.r[r as usize]);
    let offset = match offset {
        Operand::Reg(r) => ppc.r[r as usize],
        Operand::Imm(value) => value as u64,
    };
    base.wrapping_add(offset) as u32
}

fn sign_extend(value: u64, width: Width) -> u64 {
    match width {
        Width::Byte => value as u8 as i8 as i64 as u64,
        Width::Half => value as u16 as i16 as i64 as u64,
        Width::Word => value as u32 as i32 as i64 as u64,
        Width::Double => value,
    }
}

/// Evaluate BO/BI, decrementing CTR when BO asks for it
fn branch_taken(ppc: &mut PpcState, cond: Option<Condition>) -> bool {
    let Some(Condition { bo, bi }) = cond else {
        return true;
    };
    let ctr_ok = if bo & 0x04 != 0 {
        true
    } else {
        ppc.ctr = ppc.ctr.wrapping_sub(1);
        (ppc.ctr == 0) == (bo & 0x02 != 0)
    };
    let cond_ok = bo & 0x10 != 0 || ppc.cr_bit(bi) == (bo & 0x08 != 0);
    ctr_ok && cond_ok
}

fn compare(ppc: &mut PpcState, crf: u8, a: u64, b: u64, signed: bool, wide: bool) {
    let ordering = match (wide, signed) {
        (true, true) => (a as i64).cmp(&(b as i64)),
        (true, false) => a.cmp(&b),
        (false, true) => (a as i32).cmp(&(b as i32)),
        (false, false) => (a as u32).cmp(&(b as u32)),
    };
    let mut bits = match ordering {
        CmpOrdering::Less => cr::LT,
        CmpOrdering::Greater => cr::GT,
        CmpOrdering::Equal => cr::EQ,
    };
    if ppc.xer & xer::SO != 0 {
        bits |= cr::SO;
    }
    ppc.set_cr_field(crf, bits);
}

/// `a + b + carry_in`, with the carry out
fn add_with_carry(a: u64, b: u64, carry_in: bool) -> (u64, bool) {
    let sum = a as u128 + b as u128 + carry_in as u128;
    (sum as u64, sum >> 64 != 0)
}

fn imm_op(ppc: &mut PpcState, op: ImmOp, a: u64, imm: u64) -> u64 {
    match op {
        ImmOp::Add => a.wrapping_add(imm),
        ImmOp::AddCarrying => {
            let (value, carry) = add_with_carry(a, imm, false);
            ppc.set_carry(carry);
            value
        }
        ImmOp::SubFromCarrying => {
            let (value, carry) = add_with_carry(!a, imm, true);
            ppc.set_carry(carry);
            value
        }
        ImmOp::Mul => (a as i64).wrapping_mul(imm as i64) as u64,
        ImmOp::And => a & imm,
        ImmOp::Or => a | imm,
        ImmOp::Xor => a ^ imm,
    }
}

fn alu_op(ppc: &mut PpcState, op: AluOp, a: u64, b: u64) -> u64 {
    match op {
        AluOp::Add => a.wrapping_add(b),
        AluOp::AddCarrying => {
            let (value, carry) = add_with_carry(a, b, false);
            ppc.set_carry(carry);
            value
        }
        AluOp::AddExtended => {
            let (value, carry) = add_with_carry(a, b, ppc.carry());
            ppc.set_carry(carry);
            value
        }
        AluOp::SubFrom => b.wrapping_sub(a),
        AluOp::SubFromCarrying => {
            let (value, carry) = add_with_carry(!a, b, true);
            ppc.set_carry(carry);
            value
        }
        AluOp::SubFromExtended => {
            let (value, carry) = add_with_carry(!a, b, ppc.carry());
            ppc.set_carry(carry);
            value
        }
        AluOp::MulLowWord => (a as i32 as i64).wrapping_mul(b as i32 as i64) as u64,
        AluOp::MulHighWord => {
            let product = (a as i32 as i64) * (b as i32 as i64);
            (product >> 32) as u32 as u64
        }
        AluOp::MulHighWordUnsigned => {
            let product = (a as u32 as u64) * (b as u32 as u64);
            product >> 32
        }
        AluOp::MulDouble => (a as i64).wrapping_mul(b as i64) as u64,
        AluOp::DivWord => {
            let (a, b) = (a as i32, b as i32);
            // Undefined results are zero
            a.checked_div(b).map_or(0, |q| q as u32 as u64)
        }
        AluOp::DivWordUnsigned => (a as u32).checked_div(b as u32).map_or(0, u64::from),
        AluOp::DivDouble => (a as i64).checked_div(b as i64).map_or(0, |q| q as u64),
        AluOp::DivDoubleUnsigned => a.checked_div(b).unwrap_or(0),
        AluOp::And => a & b,
        AluOp::AndComplement => a & !b,
        AluOp::Or => a | b,
        AluOp::Nor => !(a | b),
        AluOp::Xor => a ^ b,
        AluOp::ShiftLeftWord => {
            let n = (b & 0x3F) as u32;
            if n > 31 {
                0
            } else {
                ((a as u32) << n) as u64
            }
        }
        AluOp::ShiftRightWord => {
            let n = (b & 0x3F) as u32;
            if n > 31 {
                0
            } else {
                ((a as u32) >> n) as u64
            }
        }
        AluOp::ShiftRightAlgebraicWord => shift_right_algebraic_word(ppc, a, (b & 0x3F) as u32),
        AluOp::ShiftLeftDouble => {
            let n = (b & 0x7F) as u32;
            if n > 63 {
                0
            } else {
                a << n
            }
        }
        AluOp::ShiftRightDouble => {
            let n = (b & 0x7F) as u32;
            if n > 63 {
                0
            } else {
                a >> n
            }
        }
    }
}

/// `sraw`/`srawi`: CA is set when a negative value loses one bits
fn shift_right_algebraic_word(ppc: &mut PpcState, a: u64, n: u32) -> u64 {
    let value = a as u32 as i32;
    let (result, carry) = if n > 31 {
        (value >> 31, value < 0)
    } else {
        let lost = (value as u32) & ((1u64 << n) - 1) as u32;
        (value >> n, value < 0 && lost != 0)
    };
    ppc.set_carry(carry);
    result as i64 as u64
}

fn unary_op(ppc: &mut PpcState, op: UnaryOp, a: u64) -> u64 {
    match op {
        UnaryOp::Negate => (a as i64).wrapping_neg() as u64,
        UnaryOp::AddToZeroExtended => {
            let (value, carry) = add_with_carry(a, 0, ppc.carry());
            ppc.set_carry(carry);
            value
        }
        UnaryOp::ExtendByte => a as u8 as i8 as i64 as u64,
        UnaryOp::ExtendHalf => a as u16 as i16 as i64 as u64,
        UnaryOp::ExtendWord => a as u32 as i32 as i64 as u64,
        UnaryOp::LeadingZerosWord => (a as u32).leading_zeros() as u64,
        UnaryOp::LeadingZerosDouble => a.leading_zeros() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm;
    use crate::config::MemoryConfig;
    use crate::disasm::decode;
    use crate::symbol::SymbolTable;
    use parking_lot::Mutex;

    const BASE: u32 = 0x1_0000;
    const SENTINEL: u32 = 0xBEBE_BEBE;

    /// Resolver over a table whose functions are all compiled up front
    struct Fixed<'a> {
        symbols: &'a SymbolTable,
    }

    impl FunctionResolver for Fixed<'_> {
        fn resolve(&self, address: u32) -> Result<Arc<FunctionSymbol>, ExecError> {
            self.symbols
                .lookup_function(address)
                .or_else(|| self.symbols.lookup_containing(address))
                .ok_or(ExecError::Dispatch { address })
        }

        fn call_extern(
            &self,
            symbol: &FunctionSymbol,
            _state: &mut ThreadState,
        ) -> Result<(), ExecError> {
            Err(ExecError::UnresolvedExtern {
                address: symbol.address(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        writes: Mutex<Vec<(u32, u64)>>,
    }

    impl RegisterHooks for RecordingHooks {
        fn read_register(&self, index: u32) -> u64 {
            0x1000 + index as u64
        }

        fn write_register(&self, index: u32, value: u64) {
            self.writes.lock().push((index, value));
        }
    }

    struct Fixture {
        memory: Arc<Memory>,
        symbols: SymbolTable,
        backend: ThreadedBackend,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_config(BackendConfig::default())
        }

        fn with_config(config: BackendConfig) -> Self {
            let memory = Memory::new(&MemoryConfig {
                size: 1 << 20,
                heap_start: 0x8_0000,
            })
            .unwrap();
            let mut backend = ThreadedBackend::new(config);
            backend.setup(memory.clone()).unwrap();
            Self {
                memory,
                symbols: SymbolTable::new(),
                backend,
            }
        }

        /// Place `words` at `address` as one function and compile it
        fn function(&self, address: u32, words: &[u32]) -> Arc<FunctionSymbol> {
            self.memory.copy_in(address, &asm::assemble(words)).unwrap();
            let (function, _) = self.symbols.declare_function(address).unwrap();
            assert!(function.try_begin_analysis());
            let flags = if words.iter().any(|w| !self.backend.supports(&decode(0, *w))) {
                FunctionFlags::UNIMPLEMENTED
            } else {
                FunctionFlags::empty()
            };
            function
                .complete_analysis(address + words.len() as u32 * 4, flags)
                .unwrap();
            let _ = function.compile_with(|s| self.backend.compile_symbol(s));
            function
        }

        fn run(&self, entry: &FunctionSymbol, r3: u64) -> (Result<(), ExecError>, ThreadState) {
            self.run_at(entry, entry.address(), r3)
        }

        fn run_at(
            &self,
            entry: &FunctionSymbol,
            address: u32,
            r3: u64,
        ) -> (Result<(), ExecError>, ThreadState) {
            let mut state = ThreadState::new(self.memory.clone(), 0x4000, 0).unwrap();
            state.ppc.r[3] = r3;
            state.ppc.lr = SENTINEL as u64;
            let resolver = Fixed {
                symbols: &self.symbols,
            };
            let result = self.backend.execute(&mut state, entry, address, &resolver);
            (result, state)
        }
    }

    #[test]
    fn test_arithmetic_and_return() {
        let fx = Fixture::new();
        let f = fx.function(
            BASE,
            &[
                asm::addi(3, 3, 5),
                asm::li(4, 3),
                asm::mullw(3, 3, 4),
                asm::neg(5, 3),
                asm::add(3, 3, 5),
                asm::addi(3, 3, -2),
                asm::blr(),
            ],
        );
        let (result, state) = fx.run(&f, 1);
        result.unwrap();
        assert_eq!(state.ppc.r[3] as i64, -2);
        assert_eq!(state.ppc.r[5] as i64, -18);
    }

    #[test]
    fn test_counted_loop() {
        let fx = Fixture::new();
        // r3 = sum of 1..=r3
        let f = fx.function(
            BASE,
            &[
                asm::mtctr(3),
                asm::li(3, 0),
                asm::mfctr(4),
                asm::add(3, 3, 4),
                asm::bdnz(-8),
                asm::blr(),
            ],
        );
        let (result, state) = fx.run(&f, 10);
        result.unwrap();
        assert_eq!(state.ppc.r[3], 55);
        assert_eq!(state.ppc.ctr, 0);
    }

    #[test]
    fn test_compare_and_branch() {
        let fx = Fixture::new();
        // r3 = max(r3, 7)
        let f = fx.function(
            BASE,
            &[
                asm::cmpwi(0, 3, 7),
                asm::bgt(0, 8),
                asm::li(3, 7),
                asm::blr(),
            ],
        );
        assert_eq!(fx.run(&f, 3).1.ppc.r[3], 7);
        assert_eq!(fx.run(&f, 12).1.ppc.r[3], 12);
        // Signed compare
        assert_eq!(fx.run(&f, (-4i64) as u64).1.ppc.r[3], 7);
    }

    #[test]
    fn test_memory_round_trip_through_stack() {
        let fx = Fixture::new();
        let f = fx.function(
            BASE,
            &[
                asm::stwu(1, -16, 1),
                asm::stw(3, 8, 1),
                asm::lhz(4, 10, 1),
                asm::lbz(5, 8, 1),
                asm::addi(1, 1, 16),
                asm::blr(),
            ],
        );
        let (result, state) = fx.run(&f, 0xAABB_CCDD);
        result.unwrap();
        assert_eq!(state.ppc.r[4], 0xCCDD);
        assert_eq!(state.ppc.r[5], 0xAA);
        let sp = state.ppc.r[1] as u32;
        assert_eq!(fx.memory.read_u32(sp - 8).unwrap(), 0xAABB_CCDD);
    }

    #[test]
    fn test_rotates_and_shifts() {
        let fx = Fixture::new();
        let f = fx.function(
            BASE,
            &[
                asm::slwi(4, 3, 4),
                asm::rlwinm(5, 3, 28, 4, 31),
                asm::srawi(6, 3, 1),
                asm::extsh(7, 3),
                asm::rldicl(8, 3, 0, 48),
                asm::blr(),
            ],
        );
        let (result, state) = fx.run(&f, 0x8000_F0F1);
        result.unwrap();
        assert_eq!(state.ppc.r[4], 0x000F_0F10);
        assert_eq!(state.ppc.r[5], 0x0800_0F0F);
        assert_eq!(state.ppc.r[6], 0xFFFF_FFFF_C000_7878);
        assert!(state.ppc.carry());
        assert_eq!(state.ppc.r[7], 0xFFFF_FFFF_FFFF_F0F1);
        assert_eq!(state.ppc.r[8], 0xF0F1);
    }

    #[test]
    fn test_call_and_nested_return() {
        let fx = Fixture::new();
        let caller = fx.function(
            BASE,
            &[
                asm::mflr(0),
                asm::bl(0x100 - 4),
                asm::addi(3, 3, 1),
                asm::mtlr(0),
                asm::blr(),
            ],
        );
        fx.function(BASE + 0x100, &[asm::mulli(3, 3, 3), asm::blr()]);

        let (result, state) = fx.run(&caller, 4);
        result.unwrap();
        assert_eq!(state.ppc.r[3], 13);
        assert_eq!(state.ppc.lr, SENTINEL as u64);
    }

    #[test]
    fn test_unbalanced_return() {
        let fx = Fixture::new();
        let f = fx.function(BASE, &[asm::li(0, 0x40), asm::mtlr(0), asm::blr()]);
        let (result, _) = fx.run(&f, 0);
        assert_eq!(
            result,
            Err(ExecError::UnbalancedReturn {
                pc: BASE + 8,
                expected: SENTINEL,
                found: 0x40
            })
        );
    }

    #[test]
    fn test_runaway_recursion_hits_depth_limit() {
        let fx = Fixture::with_config(BackendConfig {
            max_call_depth: 64,
            ..BackendConfig::default()
        });
        let f = fx.function(BASE, &[asm::bl(0), asm::blr()]);
        let (result, _) = fx.run(&f, 0);
        assert!(matches!(result, Err(ExecError::CallDepthExceeded { .. })));
    }

    #[test]
    fn test_default_depth_limit_stops_runaway_recursion() {
        let fx = Fixture::new();
        let f = fx.function(BASE, &[asm::bl(0), asm::blr()]);
        let (result, _) = fx.run(&f, 0);
        assert_eq!(
            result,
            Err(ExecError::CallDepthExceeded {
                limit: BackendConfig::default().max_call_depth
            })
        );
    }

    #[test]
    fn test_entry_inside_function() {
        let fx = Fixture::new();
        let f = fx.function(
            BASE,
            &[asm::addi(3, 3, 1), asm::addi(3, 3, 1), asm::blr()],
        );
        let (result, state) = fx.run_at(&f, BASE + 4, 0);
        result.unwrap();
        assert_eq!(state.ppc.r[3], 1);

        let entry = fx.backend.get_function_pointer(&f, BASE + 8).unwrap();
        let mut state = ThreadState::new(fx.memory.clone(), 0x1000, 0).unwrap();
        state.ppc.lr = SENTINEL as u64;
        let resolver = Fixed {
            symbols: &fx.symbols,
        };
        (*entry)(&mut state, &resolver).unwrap();
        assert_eq!(state.ppc.r[3], 0);

        assert!(fx.backend.get_function_pointer(&f, BASE + 2).is_none());
        assert!(fx.backend.get_function_pointer(&f, BASE + 12).is_none());
    }

    #[test]
    fn test_tail_call_loop_does_not_nest() {
        let fx = Fixture::new();
        // Counts r3 down to zero, bouncing through a second function
        let g = fx.function(
            BASE,
            &[
                asm::addi(3, 3, -1),
                asm::cmpwi(0, 3, 0),
                asm::beq(0, 8),
                asm::b(0x100 - 12),
                asm::blr(),
            ],
        );
        fx.function(BASE + 0x100, &[asm::b(-0x100)]);

        let (result, state) = fx.run(&g, 100_000);
        result.unwrap();
        assert_eq!(state.ppc.r[3], 0);
        assert_eq!(state.ppc.lr, SENTINEL as u64);
    }

    #[test]
    fn test_arena_capacity_is_enforced() {
        let fx = Fixture::with_config(BackendConfig {
            arena_capacity: 1,
            ..BackendConfig::default()
        });
        let f = fx.function(BASE, &[asm::blr()]);
        let g = fx.function(BASE + 0x10, &[asm::blr()]);
        assert!(f.code_handle().is_some());
        assert_eq!(
            g.compile_error(),
            Some(CompileError::ArenaExhausted { capacity: 1 })
        );

        fx.backend.release(f.take_code().unwrap());
        let h = fx.function(BASE + 0x20, &[asm::blr()]);
        assert!(h.code_handle().is_some());
        assert_eq!(fx.backend.stats().live(), 1);
    }

    #[test]
    fn test_unimplemented_function_fails_at_runtime() {
        let fx = Fixture::new();
        let f = fx.function(BASE, &[asm::sc(), asm::blr()]);
        assert!(f.flags().contains(FunctionFlags::UNIMPLEMENTED));
        assert_eq!(
            f.compile_error(),
            Some(CompileError::Unimplemented {
                address: BASE,
                code: asm::sc()
            })
        );
        let (result, _) = fx.run(&f, 0);
        assert_eq!(result, Err(ExecError::Unimplemented { address: BASE }));
    }

    #[test]
    fn test_memory_fault_is_reported() {
        let fx = Fixture::new();
        let f = fx.function(BASE, &[asm::lis(4, 0x4000), asm::lwz(3, 0, 4), asm::blr()]);
        let (result, _) = fx.run(&f, 0);
        assert_eq!(
            result,
            Err(ExecError::MemoryFault {
                address: 0x4000_0000,
                pc: BASE + 4
            })
        );
    }

    #[test]
    fn test_hardware_window_goes_to_hooks() {
        let memory = Memory::new(&MemoryConfig {
            size: 1 << 20,
            heap_start: 0x8_0000,
        })
        .unwrap();
        let hooks = Arc::new(RecordingHooks::default());
        let mut backend = ThreadedBackend::default();
        backend.set_register_hooks(hooks.clone()).unwrap();
        backend.setup(memory.clone()).unwrap();
        let fx = Fixture {
            memory,
            symbols: SymbolTable::new(),
            backend,
        };

        let f = fx.function(
            BASE,
            &[
                asm::lis(4, 0x7FC8),
                asm::stw(3, 0x10, 4),
                asm::lwz(3, 0x8, 4),
                asm::blr(),
            ],
        );
        let (result, state) = fx.run(&f, 0x55);
        result.unwrap();
        assert_eq!(state.ppc.r[3], 0x1002);
        assert_eq!(*hooks.writes.lock(), vec![(4, 0x55)]);
    }

    #[test]
    fn test_release_frees_arena() {
        let fx = Fixture::new();
        let f = fx.function(BASE, &[asm::blr()]);
        let stats = fx.backend.stats();
        assert_eq!(stats.live(), 1);

        let entry = fx.backend.get_function_pointer(&f, f.address()).unwrap();
        fx.backend.release(f.take_code().unwrap());
        assert_eq!(stats.live(), 0);
        assert!(fx.backend.get_function_pointer(&f, f.address()).is_none());

        // A host entry taken earlier keeps its code alive
        let mut state = ThreadState::new(fx.memory.clone(), 0x1000, 0).unwrap();
        state.ppc.lr = SENTINEL as u64;
        let resolver = Fixed {
            symbols: &fx.symbols,
        };
        (*entry)(&mut state, &resolver).unwrap();
    }
}
