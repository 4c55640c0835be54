// backend.rs - Code generation backend contract
//
// The processor drives any backend through this capability set and never asks
// which concrete backend it holds. A backend owns its code arena; symbols only
// carry the opaque `CodeHandle` it hands back.

use crate::disasm::Instruction;
use crate::memory::{Memory, MemoryError};
use crate::module::ExecModule;
use crate::symbol::{FunctionFlags, FunctionStatus, FunctionSymbol};
use crate::thread_state::ThreadState;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Backend-owned reference to a compiled function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeHandle(u32);

impl CodeHandle {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Why a function has no compiled form
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("function {address:#010x} is not defined")]
    NotDefined { address: u32 },

    #[error("unimplemented instruction {code:#010x} at {address:#010x}")]
    Unimplemented { address: u32, code: u32 },

    #[error("function {address:#010x} is an extern thunk")]
    Extern { address: u32 },

    #[error("code arena is full ({capacity} functions)")]
    ArenaExhausted { capacity: usize },

    #[error("backend has not been set up")]
    NotSetUp,

    #[error("guest memory: {0}")]
    Memory(#[from] MemoryError),
}

/// Failures surfaced by `execute`. Each is distinguishable from a normal
/// guest return.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("no module claims {address:#010x}")]
    Dispatch { address: u32 },

    #[error("{address:#010x} is not a function")]
    NotAFunction { address: u32 },

    #[error("{address:#010x} could not be analyzed as code")]
    AnalysisFailed { address: u32 },

    #[error("function {address:#010x} contains unimplemented instructions")]
    Unimplemented { address: u32 },

    #[error("function {address:#010x} failed to compile: {source}")]
    CompileFailed {
        address: u32,
        #[source]
        source: CompileError,
    },

    #[error("no compiled code for {address:#010x}")]
    MissingCode { address: u32 },

    #[error("extern {address:#010x} has no host handler")]
    UnresolvedExtern { address: u32 },

    #[error("memory fault at {address:#010x} (pc {pc:#010x})")]
    MemoryFault { address: u32, pc: u32 },

    #[error("return to {found:#010x} where {expected:#010x} was expected (pc {pc:#010x})")]
    UnbalancedReturn { pc: u32, expected: u32, found: u32 },

    #[error("guest call depth exceeded {limit}")]
    CallDepthExceeded { limit: usize },

    #[error("backend has not been set up")]
    NotSetUp,
}

/// Backend lifecycle failures
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend setup failed: {0}")]
    Setup(String),

    #[error("backend has not been set up")]
    NotSetUp,

    #[error("compile: {0}")]
    Compile(#[from] CompileError),
}

/// Which instructions a backend can translate
pub trait InstructionSupport {
    fn supports(&self, insn: &Instruction) -> bool;
}

/// Host side of the hardware register window
pub trait RegisterHooks: Send + Sync {
    fn read_register(&self, index: u32) -> u64;
    fn write_register(&self, index: u32, value: u64);
}

/// Host implementation of an extern (import) function
pub type ExternHandler = Arc<dyn Fn(&mut ThreadState) -> Result<(), ExecError> + Send + Sync>;

/// Host-callable entry into a compiled guest function
pub type HostEntry =
    Arc<dyn Fn(&mut ThreadState, &dyn FunctionResolver) -> Result<(), ExecError> + Send + Sync>;

/// Lets translated code reach functions it was not compiled with
pub trait FunctionResolver {
    /// Defined function at `address`, compiled unless it is an extern or
    /// carries unimplemented instructions. Runs lazy analysis on a miss.
    fn resolve(&self, address: u32) -> Result<Arc<FunctionSymbol>, ExecError>;

    /// Run the host handler registered for an extern
    fn call_extern(&self, symbol: &FunctionSymbol, state: &mut ThreadState)
        -> Result<(), ExecError>;
}

/// Can `symbol` be handed to `compile_symbol`?
pub fn is_compilable(symbol: &FunctionSymbol) -> bool {
    symbol.status() == FunctionStatus::Defined && !symbol.flags().contains(FunctionFlags::EXTERN)
}

/// A code generation backend
pub trait Backend: InstructionSupport + Send + Sync {
    fn name(&self) -> &'static str;

    /// One-time initialisation, before any module is initialised
    fn setup(&mut self, memory: Arc<Memory>) -> Result<(), BackendError>;

    /// Route the hardware register window to `hooks`
    fn set_register_hooks(&mut self, hooks: Arc<dyn RegisterHooks>) -> Result<(), BackendError>;

    /// Compile one defined function. Callers hold the symbol's compile claim
    /// (see `FunctionSymbol::compile_with`); the backend does no locking.
    fn compile_symbol(&self, symbol: &FunctionSymbol) -> Result<CodeHandle, CompileError>;

    /// Free a compiled function
    fn release(&self, handle: CodeHandle);

    /// Run `entry` on `state` from `address`, which is the entry itself or
    /// an instruction inside it, until it returns to the link register
    /// value installed by the caller
    fn execute(
        &self,
        state: &mut ThreadState,
        entry: &FunctionSymbol,
        address: u32,
        resolver: &dyn FunctionResolver,
    ) -> Result<(), ExecError>;

    /// Host-callable form of a compiled function, starting at `address`
    fn get_function_pointer(&self, symbol: &FunctionSymbol, address: u32) -> Option<HostEntry>;

    /// Compile every eligible function the module currently knows.
    ///
    /// Per-function failures are recorded on the symbol and do not fail the
    /// module; running out of code space does.
    fn init_module(&self, module: &ExecModule) -> Result<(), BackendError> {
        let mut compiled = 0usize;
        let mut failed = 0usize;
        for symbol in module.functions().iter().filter(|s| is_compilable(s)) {
            match symbol.compile_with(|s| self.compile_symbol(s)) {
                Ok(_) => compiled += 1,
                Err(err @ (CompileError::ArenaExhausted { .. } | CompileError::NotSetUp)) => {
                    return Err(err.into());
                }
                Err(err) => {
                    warn!("{}: {}", symbol.name(), err);
                    failed += 1;
                }
            }
        }
        debug!(
            "{}: initialised {} ({} compiled, {} failed)",
            self.name(),
            module.name(),
            compiled,
            failed
        );
        Ok(())
    }

    /// Release all compiled code belonging to the module. No thread may be
    /// executing inside the module.
    fn uninit_module(&self, module: &ExecModule) {
        for symbol in module.functions() {
            if let Some(handle) = symbol.take_code() {
                self.release(handle);
            }
        }
    }
}
