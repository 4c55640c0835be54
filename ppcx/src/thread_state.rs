// thread_state.rs - Guest thread context
//
// Register file plus the guest stack the thread runs on. The stack is carved
// out of the guest heap so guest code can take its address like any other
// memory; it is returned to the heap when the state is dropped. The thread
// block r13 points at belongs to whoever created the guest thread.

use crate::memory::{Memory, MemoryError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Bytes reserved below the stack top for the initial frame's back chain
const STACK_RED_ZONE: u32 = 0x40;
const STACK_ALIGN: u32 = 0x1000;

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

/// CR field bits
pub mod cr {
    pub const LT: u8 = 0b1000;
    pub const GT: u8 = 0b0100;
    pub const EQ: u8 = 0b0010;
    pub const SO: u8 = 0b0001;
}

/// XER bits
pub mod xer {
    pub const SO: u32 = 1 << 31;
    pub const OV: u32 = 1 << 30;
    pub const CA: u32 = 1 << 29;
}

/// Architectural register file
#[derive(Debug, Clone, PartialEq)]
pub struct PpcState {
    /// General purpose registers
    pub r: [u64; 32],
    /// Floating point registers
    pub f: [f64; 32],
    pub lr: u64,
    pub ctr: u64,
    pub cr: u32,
    pub xer: u32,
    /// Address of the instruction being executed
    pub cia: u32,
}

impl Default for PpcState {
    fn default() -> Self {
        Self {
            r: [0; 32],
            f: [0.0; 32],
            lr: 0,
            ctr: 0,
            cr: 0,
            xer: 0,
            cia: 0,
        }
    }
}

impl PpcState {
    /// 4-bit condition register field `n` (0 is the most significant)
    pub fn cr_field(&self, n: u8) -> u8 {
        ((self.cr >> (28 - 4 * n as u32)) & 0xF) as u8
    }

    pub fn set_cr_field(&mut self, n: u8, bits: u8) {
        let shift = 28 - 4 * n as u32;
        self.cr = (self.cr & !(0xF << shift)) | (((bits & 0xF) as u32) << shift);
    }

    /// Condition register bit `bi`, MSB-0
    pub fn cr_bit(&self, bi: u8) -> bool {
        (self.cr >> (31 - bi as u32)) & 1 != 0
    }

    pub fn set_cr_bit(&mut self, bi: u8, value: bool) {
        let bit = 1u32 << (31 - bi as u32);
        if value {
            self.cr |= bit;
        } else {
            self.cr &= !bit;
        }
    }

    pub fn carry(&self) -> bool {
        self.xer & xer::CA != 0
    }

    pub fn set_carry(&mut self, carry: bool) {
        if carry {
            self.xer |= xer::CA;
        } else {
            self.xer &= !xer::CA;
        }
    }

    /// Set CR0 from a signed comparison of `value` with zero
    pub fn record(&mut self, value: u64) {
        let value = value as i64;
        let mut bits = match value.cmp(&0) {
            std::cmp::Ordering::Less => cr::LT,
            std::cmp::Ordering::Greater => cr::GT,
            std::cmp::Ordering::Equal => cr::EQ,
        };
        if self.xer & xer::SO != 0 {
            bits |= cr::SO;
        }
        self.set_cr_field(0, bits);
    }
}

/// A guest thread: registers plus its stack in guest memory
pub struct ThreadState {
    id: u32,
    pub ppc: PpcState,
    memory: Arc<Memory>,
    stack_address: u32,
    stack_size: u32,
    thread_state_address: u32,
}

impl ThreadState {
    /// Allocate a zeroed stack of `stack_size` bytes.
    ///
    /// r1 points just below the stack top; r13 points at
    /// `thread_state_address`.
    pub fn new(
        memory: Arc<Memory>,
        stack_size: u32,
        thread_state_address: u32,
    ) -> Result<Self, MemoryError> {
        let stack_size = stack_size
            .max(STACK_ALIGN)
            .checked_next_multiple_of(STACK_ALIGN)
            .ok_or(MemoryError::OutOfHeap { size: stack_size })?;
        let stack_address = memory.heap_alloc(stack_size, STACK_ALIGN)?;
        if let Err(err) = memory.fill(stack_address, stack_size as usize, 0) {
            let _ = memory.heap_free(stack_address);
            return Err(err);
        }

        // The top may be 1 << 32 when the stack ends the address space
        let stack_top = u64::from(stack_address) + u64::from(stack_size);
        let mut ppc = PpcState::default();
        ppc.r[1] = stack_top - u64::from(STACK_RED_ZONE);
        ppc.r[13] = thread_state_address as u64;

        Ok(Self {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            ppc,
            memory,
            stack_address,
            stack_size,
            thread_state_address,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn memory(&self) -> &Arc<Memory> {
        &self.memory
    }

    pub fn stack_address(&self) -> u32 {
        self.stack_address
    }

    pub fn stack_size(&self) -> u32 {
        self.stack_size
    }

    pub fn thread_state_address(&self) -> u32 {
        self.thread_state_address
    }

    /// Integer argument `n` of the calling convention (r3..r10)
    pub fn arg(&self, n: usize) -> u64 {
        self.ppc.r.get(3 + n).copied().filter(|_| n < 8).unwrap_or(0)
    }

    pub fn set_return(&mut self, value: u64) {
        self.ppc.r[3] = value;
    }

    pub fn return_value(&self) -> u64 {
        self.ppc.r[3]
    }
}

impl Drop for ThreadState {
    fn drop(&mut self) {
        if let Err(err) = self.memory.heap_free(self.stack_address) {
            warn!("thread {}: {}", self.id, err);
        }
    }
}

impl std::fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadState")
            .field("id", &self.id)
            .field("stack_address", &self.stack_address)
            .field("stack_size", &self.stack_size)
            .field("cia", &self.ppc.cia)
            .finish()
    }
}
