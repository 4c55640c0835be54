// memory.rs - Guest memory image
//
// A flat big-endian byte space shared by the processor, every module and every
// thread state. All guest accesses go through atomics so concurrently running
// guest threads never race at the host level; ordering between guest threads
// is whatever the guest code itself establishes.

use crate::config::MemoryConfig;
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Guest memory access failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("access of {len} bytes at {address:#010x} is outside guest memory")]
    OutOfBounds { address: u32, len: usize },

    #[error("guest heap cannot satisfy {size} bytes")]
    OutOfHeap { size: u32 },

    #[error("{address:#010x} is not a live heap allocation")]
    InvalidFree { address: u32 },

    #[error("failed to map guest memory: {0}")]
    Map(String),
}

/// The guest address space
pub struct Memory {
    /// Owns the mapping `base` points into
    _map: MmapMut,
    base: NonNull<u8>,
    len: usize,
    heap: Mutex<Heap>,
}

// SAFETY: `base` points into `_map`, which lives as long as `self`. Every
// access through `base` goes through `AtomicU8`, which is Sync.
unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

impl Memory {
    /// Map a zero-filled image
    pub fn new(config: &MemoryConfig) -> Result<Arc<Self>, MemoryError> {
        if config.size == 0 || config.size > (u32::MAX as usize) + 1 {
            return Err(MemoryError::Map(format!(
                "unsupported image size {:#x}",
                config.size
            )));
        }

        let mut map =
            MmapMut::map_anon(config.size).map_err(|e| MemoryError::Map(e.to_string()))?;
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| MemoryError::Map("anonymous map returned null".to_string()))?;

        let heap_start = (config.heap_start as u64).min(config.size as u64);
        let heap = Heap::new(heap_start, config.size as u64);

        Ok(Arc::new(Self {
            _map: map,
            base,
            len: config.size,
            heap: Mutex::new(heap),
        }))
    }

    /// Image length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Does `[address, address + len)` fall inside the image?
    pub fn contains(&self, address: u32, len: usize) -> bool {
        (address as usize)
            .checked_add(len)
            .is_some_and(|end| end <= self.len)
    }

    /// Host pointer for a guest address. Only for collaborators that need raw
    /// access; the pointer must never be written into guest-visible state.
    pub fn address_of(&self, address: u32) -> Result<*const u8, MemoryError> {
        self.check(address, 1)?;
        Ok(self.base.as_ptr().wrapping_add(address as usize) as *const u8)
    }

    fn bytes(&self) -> &[AtomicU8] {
        // SAFETY: AtomicU8 has the same layout as u8 and the mapping is valid
        // for `len` bytes for the lifetime of `self`.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr() as *const AtomicU8, self.len) }
    }

    fn check(&self, address: u32, len: usize) -> Result<(), MemoryError> {
        if self.contains(address, len) {
            Ok(())
        } else {
            Err(MemoryError::OutOfBounds { address, len })
        }
    }

    fn read_be<const N: usize>(&self, address: u32) -> Result<[u8; N], MemoryError> {
        self.check(address, N)?;
        let start = address as usize;
        let mut out = [0u8; N];
        for (dst, src) in out.iter_mut().zip(&self.bytes()[start..start + N]) {
            *dst = src.load(Ordering::Relaxed);
        }
        Ok(out)
    }

    fn write_be<const N: usize>(&self, address: u32, value: [u8; N]) -> Result<(), MemoryError> {
        self.check(address, N)?;
        let start = address as usize;
        for (dst, src) in self.bytes()[start..start + N].iter().zip(value) {
            dst.store(src, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn read_u8(&self, address: u32) -> Result<u8, MemoryError> {
        Ok(self.read_be::<1>(address)?[0])
    }

    pub fn read_u16(&self, address: u32) -> Result<u16, MemoryError> {
        self.read_be(address).map(u16::from_be_bytes)
    }

    pub fn read_u32(&self, address: u32) -> Result<u32, MemoryError> {
        self.read_be(address).map(u32::from_be_bytes)
    }

    pub fn read_u64(&self, address: u32) -> Result<u64, MemoryError> {
        self.read_be(address).map(u64::from_be_bytes)
    }

    pub fn write_u8(&self, address: u32, value: u8) -> Result<(), MemoryError> {
        self.write_be(address, [value])
    }

    pub fn write_u16(&self, address: u32, value: u16) -> Result<(), MemoryError> {
        self.write_be(address, value.to_be_bytes())
    }

    pub fn write_u32(&self, address: u32, value: u32) -> Result<(), MemoryError> {
        self.write_be(address, value.to_be_bytes())
    }

    pub fn write_u64(&self, address: u32, value: u64) -> Result<(), MemoryError> {
        self.write_be(address, value.to_be_bytes())
    }

    /// Copy host bytes into guest memory
    pub fn copy_in(&self, address: u32, data: &[u8]) -> Result<(), MemoryError> {
        self.check(address, data.len())?;
        let start = address as usize;
        for (dst, src) in self.bytes()[start..start + data.len()].iter().zip(data) {
            dst.store(*src, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Copy guest memory out into a host buffer
    pub fn copy_out(&self, address: u32, out: &mut [u8]) -> Result<(), MemoryError> {
        let len = out.len();
        self.check(address, len)?;
        let start = address as usize;
        for (dst, src) in out.iter_mut().zip(&self.bytes()[start..start + len]) {
            *dst = src.load(Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn fill(&self, address: u32, len: usize, value: u8) -> Result<(), MemoryError> {
        self.check(address, len)?;
        let start = address as usize;
        for byte in &self.bytes()[start..start + len] {
            byte.store(value, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Allocate `size` bytes from the guest heap, aligned to `align`
    pub fn heap_alloc(&self, size: u32, align: u32) -> Result<u32, MemoryError> {
        self.heap.lock().alloc(size, align)
    }

    /// Return an allocation made by `heap_alloc`
    pub fn heap_free(&self, address: u32) -> Result<(), MemoryError> {
        self.heap.lock().free(address)
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory").field("len", &self.len).finish()
    }
}

/// First-fit allocator over a guest address window
struct Heap {
    /// Free ranges: start -> end (exclusive)
    free: BTreeMap<u64, u64>,
    /// Live allocations: start -> end (exclusive)
    live: HashMap<u32, u64>,
}

impl Heap {
    fn new(start: u64, end: u64) -> Self {
        let mut free = BTreeMap::new();
        if start < end {
            free.insert(start, end);
        }
        Self {
            free,
            live: HashMap::new(),
        }
    }

    fn alloc(&mut self, size: u32, align: u32) -> Result<u32, MemoryError> {
        let align = u64::from(align.max(1)).next_power_of_two();
        let wanted = u64::from(size.max(1));

        let found = self.free.iter().find_map(|(&start, &end)| {
            let aligned = start.div_ceil(align) * align;
            (aligned + wanted <= end).then_some((start, end, aligned))
        });
        let (start, end, aligned) = found.ok_or(MemoryError::OutOfHeap { size })?;

        self.free.remove(&start);
        if aligned > start {
            self.free.insert(start, aligned);
        }
        if aligned + wanted < end {
            self.free.insert(aligned + wanted, end);
        }
        self.live.insert(aligned as u32, aligned + wanted);
        Ok(aligned as u32)
    }

    fn free(&mut self, address: u32) -> Result<(), MemoryError> {
        let mut end = self
            .live
            .remove(&address)
            .ok_or(MemoryError::InvalidFree { address })?;
        let mut start = u64::from(address);

        // Coalesce with the following range
        if let Some(next_end) = self.free.remove(&end) {
            end = next_end;
        }
        // Coalesce with the preceding range
        if let Some((&prev_start, &prev_end)) = self.free.range(..start).next_back() {
            if prev_end == start {
                self.free.remove(&prev_start);
                start = prev_start;
            }
        }
        self.free.insert(start, end);
        Ok(())
    }
}
