// ppcx - Big-endian PowerPC dynamic binary translator core
//
// Loads guest images into a shared memory image, discovers function
// boundaries, translates functions on demand and runs them on guest threads.
//
// # Architecture
//
// The pipeline runs in several stages:
//
// 1. **Loading** (`processor.rs`, `elf.rs`, `container.rs`): raw binaries are
//    copied verbatim; containers place their own segments
// 2. **Decoding** (`disasm.rs`): 32-bit big-endian words to `Instruction`
// 3. **Analysis** (`cfg.rs`, `module.rs`): function bounds, eagerly from the
//    entry point and lazily from any address execution reaches
// 4. **Translation** (`translate.rs`): each instruction lowers to a `HostOp`
//    through an immutable `LoweringTable`
// 5. **Execution** (`threaded.rs`): a dispatch loop over the lowered ops and
//    the thread's register file
//
// # Symbols
//
// Every function address goes through `Declared -> Analyzing -> Defined` (or
// `Failed`). The first thread to claim an address analyzes it; everyone else
// waits for the result. Compilation happens at most once per symbol.
//
// # Calls
//
// Top-level calls install `RETURN_SENTINEL` in LR. Guest calls nest on the host
// stack, and each `blr` must return to the address its caller installed.

pub mod asm;
pub mod backend;
pub mod cfg;
pub mod config;
pub mod container;
pub mod disasm;
pub mod elf;
pub mod error;
pub mod logging;
pub mod memory;
pub mod module;
pub mod processor;
pub mod symbol;
pub mod thread_state;
pub mod threaded;
pub mod translate;

pub use backend::{
    Backend, BackendError, CodeHandle, CompileError, ExecError, ExternHandler, FunctionResolver,
    HostEntry, RegisterHooks,
};
pub use config::{BackendConfig, MemoryConfig, EXECUTE_FAILED, RETURN_SENTINEL};
pub use container::{Container, Permissions, Segment, SymbolHint};
pub use disasm::{Instruction, Opcode};
pub use elf::ElfContainer;
pub use error::{Error, Result};
pub use memory::{Memory, MemoryError};
pub use module::ExecModule;
pub use processor::Processor;
pub use symbol::{FunctionFlags, FunctionStatus, FunctionSymbol, Symbol, SymbolKind, SymbolTable};
pub use thread_state::{PpcState, ThreadState};
pub use threaded::{BackendStats, ThreadedBackend};
pub use translate::LoweringTable;
