// container.rs - Executable container abstraction
//
// A container knows how to place itself into guest memory and what it can
// tell the analyzer up front (entry point, named functions, data, imports).

use crate::memory::{Memory, MemoryError};
use crate::symbol::SymbolKind;
use bitflags::bitflags;
use std::ops::Range;

bitflags! {
    /// Segment access permissions
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Permissions: u32 {
        const EXECUTE = 1 << 0;
        const WRITE = 1 << 1;
        const READ = 1 << 2;
    }
}

/// A region the container occupies once placed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub address: u32,
    /// Size in memory (may exceed the file bytes; the rest is zero)
    pub size: u32,
    pub permissions: Permissions,
}

impl Segment {
    pub fn end(&self) -> u64 {
        self.address as u64 + self.size as u64
    }
}

/// Something the container says lives at an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolHint {
    pub address: u32,
    pub kind: SymbolKind,
    pub name: Option<String>,
    pub size: Option<u32>,
    /// Import serviced by a host handler rather than guest code
    pub external: bool,
}

impl SymbolHint {
    pub fn function(address: u32, name: impl Into<String>) -> Self {
        Self {
            address,
            kind: SymbolKind::Function,
            name: Some(name.into()),
            size: None,
            external: false,
        }
    }

    pub fn variable(address: u32, name: impl Into<String>) -> Self {
        Self {
            address,
            kind: SymbolKind::Variable,
            name: Some(name.into()),
            size: None,
            external: false,
        }
    }

    /// Import thunk of `size` bytes
    pub fn import(address: u32, name: impl Into<String>, size: u32) -> Self {
        Self {
            address,
            kind: SymbolKind::Function,
            name: Some(name.into()),
            size: Some(size),
            external: true,
        }
    }
}

/// A loadable executable format
pub trait Container {
    fn entry_point(&self) -> u32;

    fn segments(&self) -> &[Segment];

    fn symbol_hints(&self) -> Vec<SymbolHint> {
        Vec::new()
    }

    /// Copy the image into guest memory
    fn place(&self, memory: &Memory) -> Result<(), MemoryError>;
}

/// Smallest range covering every segment, or `None` if there are none or
/// they do not fit the 32-bit address space
pub fn claimed_range(segments: &[Segment]) -> Option<Range<u32>> {
    let low = segments.iter().map(|s| s.address).min()?;
    let high = segments.iter().map(Segment::end).max()?;
    let high = u32::try_from(high).ok()?;
    (low < high).then_some(low..high)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(address: u32, size: u32) -> Segment {
        Segment {
            address,
            size,
            permissions: Permissions::READ,
        }
    }

    #[test]
    fn test_claimed_range_spans_all_segments() {
        let segments = [segment(0x2000, 0x100), segment(0x1000, 0x10)];
        assert_eq!(claimed_range(&segments), Some(0x1000..0x2100));
    }

    #[test]
    fn test_claimed_range_rejects_empty_and_overflow() {
        assert_eq!(claimed_range(&[]), None);
        assert_eq!(claimed_range(&[segment(0x1000, 0)]), None);
        assert_eq!(claimed_range(&[segment(0xFFFF_FF00, 0x200)]), None);
    }
}
