// cfg.rs - Function discovery
//
// Finds the extent of guest functions by scanning forward from their entry
// and following the control flow the scan can see. Call targets found along
// the way are queued and analyzed in the same pass.

use crate::backend::InstructionSupport;
use crate::disasm::{fetch, spr, Opcode};
use crate::memory::{Memory, MemoryError};
use crate::symbol::{FunctionFlags, FunctionStatus, FunctionSymbol, SymbolTable};
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Why an address could not be analyzed as a function
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    #[error("{address:#010x} is not word aligned")]
    Misaligned { address: u32 },

    #[error("{address:#010x} starts with a padding word")]
    Padding { address: u32 },

    #[error("read fault: {0}")]
    Memory(#[from] MemoryError),
}

/// Discovered extent of one function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bounds {
    /// Exclusive end address
    pub end: u32,
    pub flags: FunctionFlags,
    /// Direct call and tail-call targets
    pub callees: Vec<u32>,
}

/// Outcome of one analysis pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalysisStats {
    pub analyzed: usize,
    pub failed: usize,
}

/// Analyzes functions inside one module's address range
pub struct Analyzer<'a> {
    memory: &'a Memory,
    symbols: &'a SymbolTable,
    range: Range<u32>,
    support: &'a dyn InstructionSupport,
}

impl<'a> Analyzer<'a> {
    pub fn new(
        memory: &'a Memory,
        symbols: &'a SymbolTable,
        range: Range<u32>,
        support: &'a dyn InstructionSupport,
    ) -> Self {
        Self {
            memory,
            symbols,
            range,
            support,
        }
    }

    /// Analyze every root and everything reachable from them by direct calls.
    ///
    /// Symbols already claimed by another pass (possibly on another thread)
    /// are skipped; that pass publishes their bounds.
    pub fn run(&self, roots: impl IntoIterator<Item = u32>) -> AnalysisStats {
        let mut queue = VecDeque::new();
        for root in roots {
            self.enqueue(root, &mut queue);
        }

        let mut stats = AnalysisStats::default();
        while let Some(function) = queue.pop_front() {
            if !function.try_begin_analysis() {
                continue;
            }

            match self.discover_bounds(function.address()) {
                Ok(bounds) => {
                    trace!(
                        "{}: [{:#010x}, {:#010x}) {:?}",
                        function.name(),
                        function.address(),
                        bounds.end,
                        bounds.flags
                    );
                    for &callee in &bounds.callees {
                        self.enqueue(callee, &mut queue);
                    }
                    if let Err(err) = function.complete_analysis(bounds.end, bounds.flags) {
                        warn!("{}", err);
                    }
                    stats.analyzed += 1;
                }
                Err(err) => {
                    debug!("{}: {}", function.name(), err);
                    if let Err(err) = function.fail_analysis() {
                        warn!("{}", err);
                    }
                    stats.failed += 1;
                }
            }
        }
        stats
    }

    fn enqueue(&self, address: u32, queue: &mut VecDeque<Arc<FunctionSymbol>>) {
        if !self.range.contains(&address) {
            return;
        }
        if let Some((function, _)) = self.symbols.declare_function(address) {
            if function.status() == FunctionStatus::Declared {
                queue.push_back(function);
            }
        }
    }

    fn is_known_entry(&self, address: u32) -> bool {
        self.symbols.lookup_function(address).is_some()
    }

    /// A direct branch that leaves the function being scanned
    fn is_tail_call(&self, start: u32, target: u32) -> bool {
        target < start
            || !self.range.contains(&target)
            || (target != start && self.is_known_entry(target))
    }

    /// Scan forward from `start` until the function provably ends.
    ///
    /// The end is the first word after an unconditional return or jump that
    /// no earlier branch skips over, the entry of another known function, a
    /// padding word, or the end of the module.
    pub fn discover_bounds(&self, start: u32) -> Result<Bounds, AnalysisError> {
        if start % 4 != 0 {
            return Err(AnalysisError::Misaligned { address: start });
        }

        let mut flags = FunctionFlags::LEAF;
        let mut callees = Vec::new();
        // Highest address some branch inside the function can reach
        let mut furthest = start;
        let mut addr = start;

        let end = loop {
            if addr >= self.range.end || (addr != start && self.is_known_entry(addr)) {
                break addr;
            }

            let insn = fetch(self.memory, addr)?;
            if insn.is_padding() {
                if addr == start {
                    return Err(AnalysisError::Padding { address: start });
                }
                break addr;
            }
            if !self.support.supports(&insn) {
                flags |= FunctionFlags::UNIMPLEMENTED;
            }

            let Some(next) = addr.checked_add(4) else {
                break addr;
            };
            let ends_here = match insn.opcode {
                Opcode::MFSPR if insn.spr() == spr::LR => {
                    flags |= FunctionFlags::SAVES_REGISTERS;
                    false
                }
                Opcode::B | Opcode::BC => match insn.branch_target() {
                    Some(target) if insn.lk() => {
                        flags.remove(FunctionFlags::LEAF);
                        callees.push(target);
                        false
                    }
                    Some(target) if self.is_tail_call(start, target) => {
                        callees.push(target);
                        insn.is_unconditional() && addr >= furthest
                    }
                    Some(target) => {
                        furthest = furthest.max(target);
                        insn.is_unconditional() && addr >= furthest
                    }
                    None => false,
                },
                Opcode::BCLR | Opcode::BCCTR => {
                    if insn.lk() {
                        flags.remove(FunctionFlags::LEAF);
                        false
                    } else {
                        insn.is_unconditional() && addr >= furthest
                    }
                }
                _ => false,
            };

            if ends_here {
                break next;
            }
            addr = next;
        };

        Ok(Bounds {
            end: end.min(self.range.end),
            flags,
            callees,
        })
    }
}
