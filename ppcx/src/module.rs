// module.rs - Execution modules
//
// A module is a contiguous guest range that belongs to one loaded image. It
// owns analysis of that range: an eager pass when the image is loaded and a
// lazy pass whenever execution lands on an address nobody has seen yet.

use crate::backend::InstructionSupport;
use crate::cfg::{AnalysisStats, Analyzer};
use crate::container::SymbolHint;
use crate::memory::Memory;
use crate::symbol::{FunctionFlags, FunctionSymbol, SymbolKind, SymbolTable};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Size assumed for an import thunk whose hint carries none
const DEFAULT_THUNK_SIZE: u32 = 4;

pub struct ExecModule {
    name: String,
    path: PathBuf,
    range: Range<u32>,
    entry_point: u32,
    memory: Arc<Memory>,
    symbols: Arc<SymbolTable>,
    hints: Vec<SymbolHint>,
    /// Functions this module has analyzed, eager and lazy
    analyzed: AtomicUsize,
}

impl ExecModule {
    pub fn new(
        name: impl Into<String>,
        path: impl AsRef<Path>,
        range: Range<u32>,
        entry_point: u32,
        memory: Arc<Memory>,
        symbols: Arc<SymbolTable>,
        hints: Vec<SymbolHint>,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.as_ref().to_path_buf(),
            range,
            entry_point,
            memory,
            symbols,
            hints,
            analyzed: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn low_address(&self) -> u32 {
        self.range.start
    }

    /// Exclusive
    pub fn high_address(&self) -> u32 {
        self.range.end
    }

    pub fn range(&self) -> Range<u32> {
        self.range.clone()
    }

    pub fn entry_point(&self) -> u32 {
        self.entry_point
    }

    pub fn contains(&self, address: u32) -> bool {
        self.range.contains(&address)
    }

    pub fn overlaps(&self, other: &Range<u32>) -> bool {
        self.range.start < other.end && other.start < self.range.end
    }

    /// Number of functions analyzed on behalf of this module so far
    pub fn analysis_count(&self) -> usize {
        self.analyzed.load(Ordering::Relaxed)
    }

    /// Function symbols currently known inside the module
    pub fn functions(&self) -> Vec<Arc<FunctionSymbol>> {
        self.symbols.functions_in(self.range())
    }

    fn analyzer<'a>(&'a self, support: &'a dyn InstructionSupport) -> Analyzer<'a> {
        Analyzer::new(&self.memory, &self.symbols, self.range(), support)
    }

    fn record(&self, stats: AnalysisStats) {
        self.analyzed.fetch_add(stats.analyzed + stats.failed, Ordering::Relaxed);
    }

    /// Eager pass: declare what the container described and analyze
    /// everything reachable from the entry point and named functions
    pub fn prepare(&self, support: &dyn InstructionSupport) -> AnalysisStats {
        let mut roots = Vec::new();
        if self.contains(self.entry_point) {
            roots.push(self.entry_point);
        }

        for hint in self.hints.iter().filter(|h| self.contains(h.address)) {
            match hint.kind {
                SymbolKind::Variable => {
                    let declaration = self.symbols.declare(hint.address, SymbolKind::Variable);
                    if let (Some(name), Some(variable)) = (&hint.name, declaration.symbol.as_variable()) {
                        variable.set_name(name.as_str());
                    }
                }
                SymbolKind::Function => {
                    let Some((function, _)) = self.symbols.declare_function(hint.address) else {
                        continue;
                    };
                    if let Some(name) = &hint.name {
                        function.set_name(name.as_str());
                    }
                    if hint.external {
                        let size = hint.size.unwrap_or(DEFAULT_THUNK_SIZE);
                        let end = hint.address.saturating_add(size).min(self.range.end);
                        if function.try_begin_analysis() {
                            let _ = function.complete_analysis(end, FunctionFlags::EXTERN);
                        }
                    } else {
                        roots.push(hint.address);
                    }
                }
            }
        }

        let stats = self.analyzer(support).run(roots);
        self.record(stats);
        info!(
            "{}: [{:#010x}, {:#010x}) {} functions analyzed, {} failed",
            self.name, self.range.start, self.range.end, stats.analyzed, stats.failed
        );
        stats
    }

    /// Lazy pass: the symbol at `address`, analyzed if this is the first
    /// time anyone asked. Returns `None` outside the module or when a data
    /// symbol owns the address.
    pub fn find_function_symbol(
        &self,
        address: u32,
        support: &dyn InstructionSupport,
    ) -> Option<Arc<FunctionSymbol>> {
        if !self.contains(address) {
            return None;
        }

        let stats = self.analyzer(support).run([address]);
        if stats.analyzed + stats.failed > 0 {
            debug!(
                "{}: lazily analyzed {} functions from {:#010x}",
                self.name,
                stats.analyzed + stats.failed,
                address
            );
        }
        self.record(stats);

        let function = self.symbols.lookup_function(address)?;
        // Another thread may own the analysis
        function.wait_analyzed();
        Some(function)
    }
}

impl Drop for ExecModule {
    fn drop(&mut self) {
        let removed = self.symbols.remove_range(self.range());
        debug!("{}: dropped {} symbols", self.name, removed);
    }
}

impl std::fmt::Debug for ExecModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecModule")
            .field("name", &self.name)
            .field("range", &self.range)
            .field("entry_point", &self.entry_point)
            .finish()
    }
}
