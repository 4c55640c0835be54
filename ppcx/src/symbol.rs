// symbol.rs - Symbol model and the process-wide symbol table
//
// The table is the single source of truth for "is this address already
// known". Function symbols carry an explicit state machine:
//
//   Declared -> Analyzing -> Defined
//                         -> Failed
//
// Whoever moves a symbol out of `Declared` owns its analysis; everybody else
// waits for a terminal state. Compiled code is attached once per symbol under
// its own lock, which is the at-most-once compile guarantee.

use crate::backend::{CodeHandle, CompileError};
use bitflags::bitflags;
use crossbeam_skiplist::SkipMap;
use parking_lot::{Condvar, Mutex};
use std::ops::RangeBounds;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// What a symbol names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    Function,
    Variable,
}

/// Analysis state of a function symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FunctionStatus {
    /// Address known, bounds not yet discovered
    Declared,
    /// One thread is discovering the bounds
    Analyzing,
    /// Bounds known; eligible for compilation
    Defined,
    /// The address could not be analyzed as code
    Failed,
}

impl FunctionStatus {
    /// Legal edges of the state machine
    pub fn can_advance_to(self, next: FunctionStatus) -> bool {
        matches!(
            (self, next),
            (FunctionStatus::Declared, FunctionStatus::Analyzing)
                | (FunctionStatus::Analyzing, FunctionStatus::Defined)
                | (FunctionStatus::Analyzing, FunctionStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FunctionStatus::Defined | FunctionStatus::Failed)
    }
}

bitflags! {
    /// Properties discovered during analysis
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FunctionFlags: u32 {
        /// Contains an instruction the backend cannot translate
        const UNIMPLEMENTED = 1 << 0;
        /// Import thunk serviced by a host handler
        const EXTERN = 1 << 1;
        /// Makes no calls
        const LEAF = 1 << 2;
        /// Saves the link register in its prologue
        const SAVES_REGISTERS = 1 << 3;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal symbol transition at {address:#010x}: {from:?} -> {to:?}")]
pub struct TransitionError {
    pub address: u32,
    pub from: FunctionStatus,
    pub to: FunctionStatus,
}

#[derive(Debug)]
struct FunctionState {
    status: FunctionStatus,
    end_address: u32,
    flags: FunctionFlags,
}

#[derive(Debug, Clone)]
enum CodeSlot {
    Empty,
    Ready(CodeHandle),
    Failed(CompileError),
}

/// A discovered (or being discovered) guest function
#[derive(Debug)]
pub struct FunctionSymbol {
    address: u32,
    name: OnceLock<String>,
    state: Mutex<FunctionState>,
    settled: Condvar,
    code: Mutex<CodeSlot>,
}

impl FunctionSymbol {
    fn new(address: u32) -> Self {
        Self {
            address,
            name: OnceLock::new(),
            state: Mutex::new(FunctionState {
                status: FunctionStatus::Declared,
                end_address: address,
                flags: FunctionFlags::empty(),
            }),
            settled: Condvar::new(),
            code: Mutex::new(CodeSlot::Empty),
        }
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    /// Name from a container hint, or a generated one
    pub fn name(&self) -> String {
        match self.name.get() {
            Some(name) => name.clone(),
            None => format!("sub_{:08X}", self.address),
        }
    }

    /// Attach a name; the first name wins
    pub fn set_name(&self, name: impl Into<String>) {
        let _ = self.name.set(name.into());
    }

    pub fn status(&self) -> FunctionStatus {
        self.state.lock().status
    }

    pub fn flags(&self) -> FunctionFlags {
        self.state.lock().flags
    }

    /// Exclusive end of the function, once it is `Defined`
    pub fn end_address(&self) -> Option<u32> {
        let state = self.state.lock();
        (state.status == FunctionStatus::Defined).then_some(state.end_address)
    }

    /// Is `address` inside `[address, end_address)` of a defined function?
    pub fn contains(&self, address: u32) -> bool {
        self.end_address()
            .is_some_and(|end| address >= self.address && address < end)
    }

    fn advance(
        &self,
        state: &mut FunctionState,
        to: FunctionStatus,
    ) -> Result<(), TransitionError> {
        if !state.status.can_advance_to(to) {
            return Err(TransitionError {
                address: self.address,
                from: state.status,
                to,
            });
        }
        state.status = to;
        Ok(())
    }

    /// Claim analysis of this symbol. Exactly one caller ever gets `true`.
    pub fn try_begin_analysis(&self) -> bool {
        let mut state = self.state.lock();
        self.advance(&mut state, FunctionStatus::Analyzing).is_ok()
    }

    /// Publish discovered bounds and wake waiters
    pub fn complete_analysis(
        &self,
        end_address: u32,
        flags: FunctionFlags,
    ) -> Result<(), TransitionError> {
        let mut state = self.state.lock();
        self.advance(&mut state, FunctionStatus::Defined)?;
        state.end_address = end_address;
        state.flags |= flags;
        self.settled.notify_all();
        Ok(())
    }

    /// Record that the address is not analyzable and wake waiters
    pub fn fail_analysis(&self) -> Result<(), TransitionError> {
        let mut state = self.state.lock();
        self.advance(&mut state, FunctionStatus::Failed)?;
        self.settled.notify_all();
        Ok(())
    }

    /// Block until analysis reaches a terminal state.
    ///
    /// A symbol still `Declared` is nobody's work yet, so this returns it
    /// as-is; callers claim it with [`try_begin_analysis`](Self::try_begin_analysis).
    pub fn wait_analyzed(&self) -> FunctionStatus {
        let mut state = self.state.lock();
        while state.status == FunctionStatus::Analyzing {
            self.settled.wait(&mut state);
        }
        state.status
    }

    /// Handle of the compiled form, if any
    pub fn code_handle(&self) -> Option<CodeHandle> {
        match &*self.code.lock() {
            CodeSlot::Ready(handle) => Some(*handle),
            _ => None,
        }
    }

    /// Compile failure recorded for this symbol
    pub fn compile_error(&self) -> Option<CompileError> {
        match &*self.code.lock() {
            CodeSlot::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// Run `compile` at most once for this symbol and cache the outcome.
    ///
    /// Concurrent callers serialize on the code slot; only the first one runs
    /// `compile`, the rest observe its handle or its error.
    pub fn compile_with<F>(&self, compile: F) -> Result<CodeHandle, CompileError>
    where
        F: FnOnce(&FunctionSymbol) -> Result<CodeHandle, CompileError>,
    {
        if self.status() != FunctionStatus::Defined {
            return Err(CompileError::NotDefined {
                address: self.address,
            });
        }

        let mut slot = self.code.lock();
        match &*slot {
            CodeSlot::Ready(handle) => Ok(*handle),
            CodeSlot::Failed(err) => Err(err.clone()),
            CodeSlot::Empty => {
                let outcome = compile(self);
                *slot = match &outcome {
                    Ok(handle) => CodeSlot::Ready(*handle),
                    Err(err) => CodeSlot::Failed(err.clone()),
                };
                outcome
            }
        }
    }

    /// Detach the compiled form so the backend can free it
    pub fn take_code(&self) -> Option<CodeHandle> {
        let mut slot = self.code.lock();
        match std::mem::replace(&mut *slot, CodeSlot::Empty) {
            CodeSlot::Ready(handle) => Some(handle),
            CodeSlot::Failed(err) => {
                *slot = CodeSlot::Failed(err);
                None
            }
            CodeSlot::Empty => None,
        }
    }
}

/// A known data address
#[derive(Debug)]
pub struct VariableSymbol {
    address: u32,
    name: OnceLock<String>,
}

impl VariableSymbol {
    fn new(address: u32) -> Self {
        Self {
            address,
            name: OnceLock::new(),
        }
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn name(&self) -> String {
        match self.name.get() {
            Some(name) => name.clone(),
            None => format!("dword_{:08X}", self.address),
        }
    }

    pub fn set_name(&self, name: impl Into<String>) {
        let _ = self.name.set(name.into());
    }
}

/// Something at a guest address
#[derive(Debug, Clone)]
pub enum Symbol {
    Function(Arc<FunctionSymbol>),
    Variable(Arc<VariableSymbol>),
}

impl Symbol {
    fn new(address: u32, kind: SymbolKind) -> Self {
        match kind {
            SymbolKind::Function => Symbol::Function(Arc::new(FunctionSymbol::new(address))),
            SymbolKind::Variable => Symbol::Variable(Arc::new(VariableSymbol::new(address))),
        }
    }

    pub fn address(&self) -> u32 {
        match self {
            Symbol::Function(f) => f.address(),
            Symbol::Variable(v) => v.address(),
        }
    }

    pub fn kind(&self) -> SymbolKind {
        match self {
            Symbol::Function(_) => SymbolKind::Function,
            Symbol::Variable(_) => SymbolKind::Variable,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Symbol::Function(f) => f.name(),
            Symbol::Variable(v) => v.name(),
        }
    }

    pub fn as_function(&self) -> Option<&Arc<FunctionSymbol>> {
        match self {
            Symbol::Function(f) => Some(f),
            Symbol::Variable(_) => None,
        }
    }

    pub fn as_variable(&self) -> Option<&Arc<VariableSymbol>> {
        match self {
            Symbol::Variable(v) => Some(v),
            Symbol::Function(_) => None,
        }
    }

    /// Same underlying symbol?
    pub fn ptr_eq(&self, other: &Symbol) -> bool {
        match (self, other) {
            (Symbol::Function(a), Symbol::Function(b)) => Arc::ptr_eq(a, b),
            (Symbol::Variable(a), Symbol::Variable(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Result of [`SymbolTable::declare`]
#[derive(Debug, Clone)]
pub struct Declaration {
    pub symbol: Symbol,
    /// This call created the entry
    pub inserted: bool,
}

/// Address-ordered map of every known symbol, shared by all modules
#[derive(Debug, Default)]
pub struct SymbolTable {
    entries: SkipMap<u32, Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            entries: SkipMap::new(),
        }
    }

    /// Return the symbol at `address`, creating it in its initial state if
    /// absent. Concurrent callers for one address all receive the same
    /// symbol and exactly one of them sees `inserted`.
    pub fn declare(&self, address: u32, kind: SymbolKind) -> Declaration {
        let candidate = Symbol::new(address, kind);
        let entry = self.entries.get_or_insert(address, candidate.clone());
        let symbol = entry.value().clone();
        let inserted = symbol.ptr_eq(&candidate);
        Declaration { symbol, inserted }
    }

    /// Declare a function; `None` if a variable already owns the address
    pub fn declare_function(&self, address: u32) -> Option<(Arc<FunctionSymbol>, bool)> {
        let declaration = self.declare(address, SymbolKind::Function);
        let function = declaration.symbol.as_function()?.clone();
        Some((function, declaration.inserted))
    }

    /// Point lookup
    pub fn lookup(&self, address: u32) -> Option<Symbol> {
        self.entries.get(&address).map(|entry| entry.value().clone())
    }

    pub fn lookup_function(&self, address: u32) -> Option<Arc<FunctionSymbol>> {
        self.lookup(address)?.as_function().cloned()
    }

    /// The defined function whose `[address, end_address)` holds `address`.
    ///
    /// Walks downward from `address`; a function discovered lazily in the
    /// middle of another one can shadow the nearest entry, so the walk does
    /// not stop at the first miss.
    pub fn lookup_containing(&self, address: u32) -> Option<Arc<FunctionSymbol>> {
        self.entries
            .range(..=address)
            .rev()
            .filter_map(|entry| entry.value().as_function().cloned())
            .find(|function| function.contains(address))
    }

    /// Function symbols whose entry lies in `range`, in address order
    pub fn functions_in(&self, range: impl RangeBounds<u32>) -> Vec<Arc<FunctionSymbol>> {
        self.entries
            .range::<u32, _>(range)
            .filter_map(|entry| entry.value().as_function().cloned())
            .collect()
    }

    /// Drop every symbol whose address lies in `range`
    pub fn remove_range(&self, range: impl RangeBounds<u32>) -> usize {
        let mut removed = 0;
        for entry in self.entries.range::<u32, _>(range) {
            if entry.remove() {
                removed += 1;
            }
        }
        removed
    }

    /// Point-in-time copy of all symbols, in address order
    pub fn snapshot(&self) -> Vec<Symbol> {
        self.entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn defined(table: &SymbolTable, address: u32, end: u32) -> Arc<FunctionSymbol> {
        let (function, _) = table.declare_function(address).unwrap();
        assert!(function.try_begin_analysis());
        function.complete_analysis(end, FunctionFlags::LEAF).unwrap();
        function
    }

    #[test]
    fn test_declare_is_idempotent() {
        let table = SymbolTable::new();
        let first = table.declare(0x1000, SymbolKind::Function);
        let second = table.declare(0x1000, SymbolKind::Function);
        assert!(first.inserted);
        assert!(!second.inserted);
        assert!(first.symbol.ptr_eq(&second.symbol));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_variable_blocks_function_declaration() {
        let table = SymbolTable::new();
        table.declare(0x2000, SymbolKind::Variable);
        assert!(table.declare_function(0x2000).is_none());
        assert_eq!(
            table.lookup(0x2000).map(|s| s.kind()),
            Some(SymbolKind::Variable)
        );
    }

    #[test]
    fn test_concurrent_declare_has_one_owner() {
        let table = SymbolTable::new();
        let inserted = AtomicUsize::new(0);
        let owners = AtomicUsize::new(0);

        let symbols: Vec<Symbol> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        let declaration = table.declare(0x4000, SymbolKind::Function);
                        if declaration.inserted {
                            inserted.fetch_add(1, Ordering::SeqCst);
                        }
                        let function = declaration.symbol.as_function().unwrap().clone();
                        if function.try_begin_analysis() {
                            owners.fetch_add(1, Ordering::SeqCst);
                            function.complete_analysis(0x4010, FunctionFlags::empty()).unwrap();
                        }
                        assert_eq!(function.wait_analyzed(), FunctionStatus::Defined);
                        declaration.symbol
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(inserted.load(Ordering::SeqCst), 1);
        assert_eq!(owners.load(Ordering::SeqCst), 1);
        assert!(symbols.iter().all(|s| s.ptr_eq(&symbols[0])));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_status_only_moves_forward() {
        let table = SymbolTable::new();
        let (function, _) = table.declare_function(0x100).unwrap();
        assert!(function.complete_analysis(0x110, FunctionFlags::empty()).is_err());
        assert!(function.try_begin_analysis());
        assert!(!function.try_begin_analysis());
        function.fail_analysis().unwrap();
        assert_eq!(function.status(), FunctionStatus::Failed);
        assert!(function.complete_analysis(0x110, FunctionFlags::empty()).is_err());
        assert_eq!(function.end_address(), None);
    }

    #[test]
    fn test_lookup_containing_boundaries() {
        let table = SymbolTable::new();
        let function = defined(&table, 0x1000, 0x1010);

        assert!(Arc::ptr_eq(&table.lookup_containing(0x1000).unwrap(), &function));
        assert!(Arc::ptr_eq(&table.lookup_containing(0x100C).unwrap(), &function));
        assert!(table.lookup_containing(0x1010).is_none());
        assert!(table.lookup_containing(0x0FFC).is_none());
    }

    #[test]
    fn test_lookup_containing_ignores_undefined() {
        let table = SymbolTable::new();
        table.declare_function(0x1000).unwrap();
        assert!(table.lookup_containing(0x1000).is_none());
    }

    #[test]
    fn test_lookup_containing_sees_past_nested_function() {
        let table = SymbolTable::new();
        let outer = defined(&table, 0x1000, 0x1100);
        defined(&table, 0x1040, 0x1060);
        assert!(Arc::ptr_eq(&table.lookup_containing(0x1080).unwrap(), &outer));
    }

    #[test]
    fn test_compile_runs_once() {
        let table = SymbolTable::new();
        let function = defined(&table, 0x1000, 0x1004);
        let calls = AtomicUsize::new(0);

        let compile = |_: &FunctionSymbol| -> Result<CodeHandle, CompileError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(CodeHandle::new(7))
        };
        assert_eq!(function.compile_with(compile).unwrap(), CodeHandle::new(7));
        assert_eq!(function.compile_with(compile).unwrap(), CodeHandle::new(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(function.take_code(), Some(CodeHandle::new(7)));
        assert_eq!(function.code_handle(), None);
    }

    #[test]
    fn test_compile_requires_defined() {
        let table = SymbolTable::new();
        let (function, _) = table.declare_function(0x1000).unwrap();
        let err = function
            .compile_with(|_| Ok(CodeHandle::new(1)))
            .unwrap_err();
        assert_eq!(err, CompileError::NotDefined { address: 0x1000 });
    }

    #[test]
    fn test_remove_range() {
        let table = SymbolTable::new();
        table.declare(0x1000, SymbolKind::Function);
        table.declare(0x1004, SymbolKind::Variable);
        table.declare(0x2000, SymbolKind::Function);
        assert_eq!(table.remove_range(0x1000..0x2000), 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.functions_in(..).len(), 1);
    }

    #[test]
    fn test_functions_in_reaches_top_of_address_space() {
        let table = SymbolTable::new();
        table.declare(0x1000, SymbolKind::Function);
        table.declare(u32::MAX, SymbolKind::Function);
        let all = table.functions_in(..);
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].address(), u32::MAX);
        assert_eq!(table.functions_in(0x2000..=u32::MAX).len(), 1);

        assert_eq!(table.remove_range(0x2000..), 1);
        assert_eq!(table.len(), 1);
    }
}
