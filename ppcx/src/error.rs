// error.rs - Crate level error type

use crate::backend::{BackendError, CompileError, ExecError};
use crate::elf::ElfError;
use crate::memory::MemoryError;
use std::path::PathBuf;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("processor has not been set up")]
    NotSetUp,

    #[error("processor is already set up")]
    AlreadySetUp,

    #[error("no hardware register hooks attached")]
    MissingHardwareHooks,

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: image is empty", path.display())]
    EmptyImage { path: PathBuf },

    #[error("image of {len:#x} bytes at {start:#010x} does not fit the guest address space")]
    ImageTooLarge { start: u32, len: u64 },

    #[error("[{start:#010x}, {end:#010x}) overlaps module {existing}")]
    Overlap {
        start: u32,
        end: u32,
        existing: String,
    },

    #[error("no module is loaded at {0:#010x}")]
    NoSuchModule(u32),

    #[error("{address:#010x} is already defined as guest code")]
    ExternConflict { address: u32 },

    #[error("guest memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("elf error: {0}")]
    Elf(#[from] ElfError),

    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

pub type Result<T> = std::result::Result<T, Error>;
