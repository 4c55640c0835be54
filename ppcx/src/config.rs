// config.rs - Runtime configuration and well-known guest constants

use std::ops::Range;

/// Link register value installed before a top-level call. A `blr` that
/// observes it has unwound the call set up by `Processor::execute`.
pub const RETURN_SENTINEL: u32 = 0xBEBE_BEBE;

/// Returned by `Processor::execute_with_arg` when execution fails.
pub const EXECUTE_FAILED: u64 = 0xDEAD_BABE;

/// Guest window routed to the hardware register hooks instead of memory.
pub const DEFAULT_HARDWARE_RANGE: Range<u32> = 0x7FC8_0000..0x7FD0_0000;

/// Guest memory image layout
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Size of the image in bytes
    pub size: usize,
    /// First guest address handed out by the heap allocator
    pub heap_start: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            size: 64 << 20,
            heap_start: 0x0200_0000,
        }
    }
}

/// Backend tuning knobs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendConfig {
    /// Loads and stores inside this window go to the register hooks
    pub hardware_range: Range<u32>,
    /// Maximum nesting of guest calls on one thread
    pub max_call_depth: usize,
    /// Maximum number of live compiled functions
    pub arena_capacity: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            hardware_range: DEFAULT_HARDWARE_RANGE,
            max_call_depth: 128,
            arena_capacity: 1 << 20,
        }
    }
}
