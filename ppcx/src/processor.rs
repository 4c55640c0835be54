// processor.rs - Translator orchestration
//
// The processor owns the symbol table, the loaded modules and the backend.
// Modules are loaded and unloaded through `&mut self`, so the borrow checker
// keeps loading out of the way of concurrent execution; everything a guest
// thread needs at run time works through `&self`.

use crate::backend::{
    is_compilable, Backend, ExecError, ExternHandler, FunctionResolver, HostEntry,
    InstructionSupport, RegisterHooks,
};
use crate::config::{EXECUTE_FAILED, RETURN_SENTINEL};
use crate::container::{claimed_range, Container};
use crate::disasm::Instruction;
use crate::elf::ElfContainer;
use crate::error::{Error, Result};
use crate::memory::{Memory, MemoryError};
use crate::module::ExecModule;
use crate::symbol::{FunctionFlags, FunctionStatus, FunctionSymbol, Symbol, SymbolTable};
use crate::thread_state::ThreadState;
use dashmap::DashMap;
use memmap2::Mmap;
use std::fs::File;
use std::io::Write;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Answers analysis questions from the backend's lowering table
struct Support<'a>(&'a dyn Backend);

impl InstructionSupport for Support<'_> {
    fn supports(&self, insn: &Instruction) -> bool {
        self.0.supports(insn)
    }
}

pub struct Processor {
    memory: Arc<Memory>,
    backend: Box<dyn Backend>,
    hooks: Option<Arc<dyn RegisterHooks>>,
    /// Created by `setup`
    symbols: Option<Arc<SymbolTable>>,
    /// In load order
    modules: Vec<ExecModule>,
    externs: DashMap<u32, ExternHandler>,
}

impl Processor {
    pub fn new(memory: Arc<Memory>, backend: Box<dyn Backend>) -> Self {
        Self {
            memory,
            backend,
            hooks: None,
            symbols: None,
            modules: Vec::new(),
            externs: DashMap::new(),
        }
    }

    /// Attach the hardware register collaborator. Must happen before `setup`.
    pub fn set_register_hooks(&mut self, hooks: Arc<dyn RegisterHooks>) {
        self.hooks = Some(hooks);
    }

    pub fn setup(&mut self) -> Result<()> {
        if self.symbols.is_some() {
            return Err(Error::AlreadySetUp);
        }
        let hooks = self.hooks.clone().ok_or(Error::MissingHardwareHooks)?;

        self.backend.setup(self.memory.clone())?;
        self.backend.set_register_hooks(hooks)?;
        self.symbols = Some(Arc::new(SymbolTable::new()));
        info!("processor ready ({} backend)", self.backend.name());
        Ok(())
    }

    pub fn memory(&self) -> &Arc<Memory> {
        &self.memory
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn symbols(&self) -> Option<&Arc<SymbolTable>> {
        self.symbols.as_ref()
    }

    pub fn modules(&self) -> &[ExecModule] {
        &self.modules
    }

    fn symbol_table(&self) -> Result<Arc<SymbolTable>> {
        self.symbols.clone().ok_or(Error::NotSetUp)
    }

    /// Copy a flat image to `start` and claim `[start, start + len)`
    pub fn load_raw_binary(&mut self, path: impl AsRef<Path>, start: u32) -> Result<()> {
        let path = path.as_ref();
        let symbols = self.symbol_table()?;

        let range = {
            let map = map_file(path)?;
            let end = u32::try_from(map.len())
                .ok()
                .and_then(|len| start.checked_add(len))
                .ok_or(Error::ImageTooLarge {
                    start,
                    len: map.len() as u64,
                })?;
            let range = start..end;
            self.check_claim(&range)?;
            self.memory.copy_in(start, &map)?;
            range
        };

        let module = ExecModule::new(
            module_name(path),
            path,
            range,
            start,
            self.memory.clone(),
            symbols,
            Vec::new(),
        );
        self.install(module)
    }

    /// Load an image whose layout comes from a container parser
    pub fn load_container_module(
        &mut self,
        name: &str,
        path: impl AsRef<Path>,
        container: &dyn Container,
    ) -> Result<()> {
        let path = path.as_ref();
        let symbols = self.symbol_table()?;
        let range = claimed_range(container.segments()).ok_or_else(|| Error::EmptyImage {
            path: path.to_path_buf(),
        })?;
        self.check_claim(&range)?;
        container.place(&self.memory)?;

        let module = ExecModule::new(
            name,
            path,
            range,
            container.entry_point(),
            self.memory.clone(),
            symbols,
            container.symbol_hints(),
        );
        self.install(module)
    }

    /// Load a big-endian PowerPC ELF executable
    pub fn load_elf_module(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let container = {
            let map = map_file(path)?;
            ElfContainer::parse(&map)?
        };
        self.load_container_module(&module_name(path), path, &container)
    }

    fn check_claim(&self, range: &Range<u32>) -> Result<()> {
        if let Some(existing) = self.modules.iter().find(|m| m.overlaps(range)) {
            return Err(Error::Overlap {
                start: range.start,
                end: range.end,
                existing: existing.name().to_string(),
            });
        }
        if !self
            .memory
            .contains(range.start, (range.end - range.start) as usize)
        {
            return Err(MemoryError::OutOfBounds {
                address: range.start,
                len: (range.end - range.start) as usize,
            }
            .into());
        }
        Ok(())
    }

    fn install(&mut self, module: ExecModule) -> Result<()> {
        module.prepare(&Support(self.backend.as_ref()));
        if let Err(err) = self.backend.init_module(&module) {
            warn!("{}: backend init failed: {}", module.name(), err);
            self.backend.uninit_module(&module);
            // Dropping the module releases its symbols
            drop(module);
            return Err(err.into());
        }

        info!(
            "loaded {} at [{:#010x}, {:#010x}), entry {:#010x}",
            module.name(),
            module.low_address(),
            module.high_address(),
            module.entry_point()
        );
        self.modules.push(module);
        Ok(())
    }

    /// Release the module loaded at `base_address` along with its code and
    /// symbols. No thread may be running inside it.
    pub fn unload_module(&mut self, base_address: u32) -> Result<()> {
        let index = self
            .modules
            .iter()
            .position(|m| m.low_address() == base_address)
            .ok_or(Error::NoSuchModule(base_address))?;
        let module = self.modules.remove(index);
        self.backend.uninit_module(&module);
        info!("unloaded {}", module.name());
        Ok(())
    }

    /// Function symbol for `address`, running lazy analysis on a miss.
    ///
    /// An address inside an already analyzed function resolves to that
    /// function. The returned symbol may be `Failed`.
    pub fn get_function(&self, address: u32) -> std::result::Result<Arc<FunctionSymbol>, ExecError> {
        let symbols = self.symbols.as_ref().ok_or(ExecError::NotSetUp)?;
        match symbols.lookup(address) {
            Some(Symbol::Variable(_)) => return Err(ExecError::NotAFunction { address }),
            Some(Symbol::Function(function)) if function.status().is_terminal() => {
                return Ok(function)
            }
            Some(Symbol::Function(_)) => {}
            None => {
                if let Some(function) = symbols.lookup_containing(address) {
                    return Ok(function);
                }
            }
        }

        let Some(module) = self.modules.iter().find(|m| m.contains(address)) else {
            error!("dispatch to unclaimed address {:#010x}", address);
            return Err(ExecError::Dispatch { address });
        };
        module
            .find_function_symbol(address, &Support(self.backend.as_ref()))
            .ok_or(ExecError::NotAFunction { address })
    }

    /// Compile `symbol` if it is eligible and nobody has yet. Unimplemented
    /// functions and externs are left for the backend to report or route.
    fn ensure_compiled(&self, symbol: &FunctionSymbol) -> std::result::Result<(), ExecError> {
        let address = symbol.address();
        match symbol.status() {
            FunctionStatus::Defined => {}
            FunctionStatus::Failed => return Err(ExecError::AnalysisFailed { address }),
            FunctionStatus::Declared | FunctionStatus::Analyzing => {
                return Err(ExecError::MissingCode { address })
            }
        }
        if !is_compilable(symbol) || symbol.flags().contains(FunctionFlags::UNIMPLEMENTED) {
            return Ok(());
        }

        symbol
            .compile_with(|s| self.backend.compile_symbol(s))
            .map(|_| ())
            .map_err(|source| {
                warn!("{}: {}", symbol.name(), source);
                ExecError::CompileFailed { address, source }
            })
    }

    /// Run the function at `address` to completion on `state`
    pub fn execute(&self, state: &mut ThreadState, address: u32) -> std::result::Result<(), ExecError> {
        let symbol = self.resolve(address)?;
        state.ppc.lr = RETURN_SENTINEL as u64;
        debug!("thread {}: execute {}", state.id(), symbol.name());
        self.backend.execute(state, &symbol, address, self)
    }

    /// Call with one argument; returns r3, or `EXECUTE_FAILED` on failure
    pub fn execute_with_arg(&self, state: &mut ThreadState, address: u32, arg0: u64) -> u64 {
        state.ppc.r[3] = arg0;
        match self.execute(state, address) {
            Ok(()) => state.return_value(),
            Err(err) => {
                error!("thread {}: {}", state.id(), err);
                EXECUTE_FAILED
            }
        }
    }

    /// Call with up to eight integer arguments and return r3
    pub fn call(
        &self,
        state: &mut ThreadState,
        address: u32,
        args: &[u64],
    ) -> std::result::Result<u64, ExecError> {
        for (register, value) in state.ppc.r[3..11].iter_mut().zip(args) {
            *register = *value;
        }
        self.execute(state, address)?;
        Ok(state.return_value())
    }

    /// Host entry for the function at `address`, compiling it if needed.
    /// Invoke it with this processor as the resolver.
    pub fn get_function_pointer(&self, address: u32) -> Option<HostEntry> {
        let symbol = self.resolve(address).ok()?;
        self.backend.get_function_pointer(&symbol, address)
    }

    /// Route calls to `address` to a host handler. An address nobody has
    /// analyzed yet becomes an extern thunk.
    pub fn register_extern(&self, address: u32, handler: ExternHandler) -> Result<()> {
        let symbols = self.symbol_table()?;
        let (function, _) = symbols
            .declare_function(address)
            .ok_or(ExecError::NotAFunction { address })?;
        if function.try_begin_analysis() {
            let end = address.saturating_add(4);
            if let Err(err) = function.complete_analysis(end, FunctionFlags::EXTERN) {
                warn!("{}: {}", function.name(), err);
            }
        }
        if !function.flags().contains(FunctionFlags::EXTERN) {
            return Err(Error::ExternConflict { address });
        }

        self.externs.insert(address, handler);
        debug!("extern {} registered", function.name());
        Ok(())
    }

    pub fn alloc_thread(
        &self,
        stack_size: u32,
        thread_state_address: u32,
    ) -> std::result::Result<ThreadState, MemoryError> {
        let state = ThreadState::new(self.memory.clone(), stack_size, thread_state_address)?;
        debug!(
            "thread {}: stack [{:#010x}, {:#010x})",
            state.id(),
            state.stack_address(),
            state.stack_address() + state.stack_size()
        );
        Ok(state)
    }

    pub fn dealloc_thread(&self, state: ThreadState) {
        debug!("thread {}: released", state.id());
        drop(state);
    }

    /// One line per known symbol, in address order
    pub fn dump_symbols(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let Some(symbols) = &self.symbols else {
            return Ok(());
        };
        for symbol in symbols.snapshot() {
            match &symbol {
                Symbol::Function(function) => {
                    let end = function
                        .end_address()
                        .map(|end| format!("{:08X}", end))
                        .unwrap_or_else(|| "--------".to_string());
                    writeln!(
                        out,
                        "{:08X} {} func {:<10} {:?} {}",
                        function.address(),
                        end,
                        format!("{:?}", function.status()),
                        function.flags(),
                        function.name()
                    )?;
                }
                Symbol::Variable(variable) => {
                    writeln!(
                        out,
                        "{:08X} -------- data {}",
                        variable.address(),
                        variable.name()
                    )?;
                }
            }
        }
        Ok(())
    }
}

impl FunctionResolver for Processor {
    fn resolve(&self, address: u32) -> std::result::Result<Arc<FunctionSymbol>, ExecError> {
        let function = self.get_function(address)?;
        self.ensure_compiled(&function)?;
        Ok(function)
    }

    fn call_extern(
        &self,
        symbol: &FunctionSymbol,
        state: &mut ThreadState,
    ) -> std::result::Result<(), ExecError> {
        let address = symbol.address();
        let handler = self
            .externs
            .get(&address)
            .map(|entry| entry.value().clone())
            .ok_or(ExecError::UnresolvedExtern { address })?;
        handler(state)
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        // Backend code goes first, then modules (which prune the table),
        // then the table itself
        for module in &self.modules {
            self.backend.uninit_module(module);
        }
        self.modules.clear();
        self.externs.clear();
        self.symbols = None;
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("backend", &self.backend.name())
            .field("modules", &self.modules)
            .field("ready", &self.symbols.is_some())
            .finish()
    }
}

fn map_file(path: &Path) -> Result<Mmap> {
    let io_error = |source| Error::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io_error)?;
    if file.metadata().map_err(io_error)?.len() == 0 {
        return Err(Error::EmptyImage {
            path: path.to_path_buf(),
        });
    }
    // SAFETY: the mapping is read once and dropped before the load returns
    unsafe { Mmap::map(&file) }.map_err(io_error)
}

fn module_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
