// processor_tests.rs - End-to-end scenarios through the processor

use parking_lot::Mutex;
use ppcx::asm;
use ppcx::{
    BackendConfig, BackendStats, Container, Error, ExecError, FunctionStatus, Memory,
    MemoryConfig, MemoryError, Permissions, Processor, RegisterHooks, Segment, SymbolHint,
    ThreadState, ThreadedBackend, EXECUTE_FAILED, RETURN_SENTINEL,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const BASE: u32 = 0x10000;

#[derive(Default)]
struct RecordingHooks {
    writes: Mutex<Vec<(u32, u64)>>,
}

impl RegisterHooks for RecordingHooks {
    fn read_register(&self, index: u32) -> u64 {
        0x1000 + index as u64
    }

    fn write_register(&self, index: u32, value: u64) {
        self.writes.lock().push((index, value));
    }
}

/// Guest image written to a scratch file, removed on drop
struct TempImage(PathBuf);

impl TempImage {
    fn new(words: &[u32]) -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let path = std::env::temp_dir().join(format!(
            "ppcx-{}-{}.bin",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&path, asm::assemble(words)).unwrap();
        Self(path)
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempImage {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

struct Setup {
    processor: Processor,
    memory: Arc<Memory>,
    stats: Arc<BackendStats>,
    hooks: Arc<RecordingHooks>,
}

fn memory() -> Arc<Memory> {
    Memory::new(&MemoryConfig {
        size: 16 << 20,
        heap_start: 8 << 20,
    })
    .unwrap()
}

fn setup() -> Setup {
    let memory = memory();
    let backend = ThreadedBackend::new(BackendConfig::default());
    let stats = backend.stats();
    let hooks = Arc::new(RecordingHooks::default());
    let mut processor = Processor::new(memory.clone(), Box::new(backend));
    processor.set_register_hooks(hooks.clone());
    processor.setup().unwrap();
    Setup {
        processor,
        memory,
        stats,
        hooks,
    }
}

fn thread(processor: &Processor) -> ThreadState {
    processor.alloc_thread(0x4000, 0).unwrap()
}

/// Saves LR, calls through CTR to `BASE + 0x40`, restores LR and returns
fn indirect_caller() -> Vec<u32> {
    let mut words = vec![
        asm::mflr(0),
        asm::stwu(1, -16, 1),
        asm::stw(0, 20, 1),
        asm::lis(4, 1),
        asm::ori(4, 4, 0x40),
        asm::mtctr(4),
        asm::bctrl(),
        asm::lwz(0, 20, 1),
        asm::addi(1, 1, 16),
        asm::mtlr(0),
        asm::blr(),
    ];
    // Zero padding up to the callee
    words.resize(0x10, 0);
    words.extend([asm::addi(3, 3, 1), asm::blr()]);
    words
}

#[test]
fn test_raw_binary_claims_file_length() {
    let mut fx = setup();
    let image = TempImage::new(&[asm::nop(), asm::blr()]);
    fx.processor.load_raw_binary(image.path(), BASE).unwrap();

    let module = &fx.processor.modules()[0];
    assert_eq!(module.range(), BASE..BASE + 8);
    assert_eq!(module.entry_point(), BASE);

    let mut state = thread(&fx.processor);
    assert_eq!(fx.processor.execute_with_arg(&mut state, BASE, 42), 42);
    assert_eq!(state.ppc.lr, RETURN_SENTINEL as u64);
}

#[test]
fn test_unclaimed_address_is_a_dispatch_failure() {
    let fx = setup();
    assert_eq!(
        fx.processor.get_function(0xFFFF_FFFF).unwrap_err(),
        ExecError::Dispatch {
            address: 0xFFFF_FFFF
        }
    );

    let mut state = thread(&fx.processor);
    assert_eq!(
        fx.processor.execute_with_arg(&mut state, 0xFFFF_FFFF, 1),
        EXECUTE_FAILED
    );
}

#[test]
fn test_indirect_target_is_discovered_lazily() {
    let mut fx = setup();
    let image = TempImage::new(&indirect_caller());
    fx.processor.load_raw_binary(image.path(), BASE).unwrap();

    let symbols = fx.processor.symbols().unwrap().clone();
    assert!(symbols.lookup(BASE + 0x40).is_none());
    assert_eq!(fx.processor.modules()[0].analysis_count(), 1);

    let mut state = thread(&fx.processor);
    assert_eq!(fx.processor.execute_with_arg(&mut state, BASE, 5), 6);
    assert_eq!(fx.processor.modules()[0].analysis_count(), 2);

    let callee = symbols.lookup_function(BASE + 0x40).unwrap();
    assert_eq!(callee.status(), FunctionStatus::Defined);
    let again = fx.processor.get_function(BASE + 0x40).unwrap();
    assert!(Arc::ptr_eq(&callee, &again));
    assert_eq!(fx.processor.modules()[0].analysis_count(), 2);
}

#[test]
fn test_overlapping_load_is_rejected() {
    let mut fx = setup();
    let first = TempImage::new(&[asm::blr(), asm::blr()]);
    fx.processor.load_raw_binary(first.path(), BASE).unwrap();

    let second = TempImage::new(&[asm::blr()]);
    let err = fx
        .processor
        .load_raw_binary(second.path(), BASE + 4)
        .unwrap_err();
    assert!(matches!(err, Error::Overlap { start, .. } if start == BASE + 4));

    // Still usable for other modules
    fx.processor.load_raw_binary(second.path(), 0x20000).unwrap();
    assert_eq!(fx.processor.modules().len(), 2);
}

#[test]
fn test_load_errors() {
    let mut fx = setup();
    let empty = TempImage::new(&[]);
    assert!(matches!(
        fx.processor.load_raw_binary(empty.path(), BASE),
        Err(Error::EmptyImage { .. })
    ));
    assert!(matches!(
        fx.processor.load_raw_binary("/nonexistent/ppcx/image.bin", BASE),
        Err(Error::Io { .. })
    ));

    let image = TempImage::new(&[asm::blr()]);
    assert!(matches!(
        fx.processor.load_raw_binary(image.path(), 0x0200_0000),
        Err(Error::Memory(MemoryError::OutOfBounds { .. }))
    ));
    assert!(fx.processor.modules().is_empty());
}

#[test]
fn test_setup_preconditions() {
    let memory = memory();
    let mut processor = Processor::new(memory.clone(), Box::new(ThreadedBackend::default()));
    let image = TempImage::new(&[asm::blr()]);
    assert!(matches!(
        processor.load_raw_binary(image.path(), BASE),
        Err(Error::NotSetUp)
    ));
    assert!(matches!(processor.setup(), Err(Error::MissingHardwareHooks)));

    processor.set_register_hooks(Arc::new(RecordingHooks::default()));
    processor.setup().unwrap();
    assert!(matches!(processor.setup(), Err(Error::AlreadySetUp)));
}

#[test]
fn test_unimplemented_function_fails_only_when_called() {
    let mut fx = setup();
    let image = TempImage::new(&[asm::li(3, 7), asm::blr(), asm::sc(), asm::blr()]);
    fx.processor.load_raw_binary(image.path(), BASE).unwrap();

    let mut state = thread(&fx.processor);
    assert_eq!(fx.processor.execute_with_arg(&mut state, BASE, 0), 7);
    assert_eq!(
        fx.processor.execute(&mut state, BASE + 8).unwrap_err(),
        ExecError::Unimplemented { address: BASE + 8 }
    );
    assert_eq!(
        fx.processor.execute_with_arg(&mut state, BASE + 8, 0),
        EXECUTE_FAILED
    );
}

#[test]
fn test_hardware_register_window() {
    let mut fx = setup();
    let image = TempImage::new(&[
        asm::lis(4, 0x7FC8),
        asm::stw(3, 0x10, 4),
        asm::lwz(3, 0x8, 4),
        asm::blr(),
    ]);
    fx.processor.load_raw_binary(image.path(), BASE).unwrap();

    let mut state = thread(&fx.processor);
    assert_eq!(fx.processor.execute_with_arg(&mut state, BASE, 0x55), 0x1002);
    assert_eq!(*fx.hooks.writes.lock(), vec![(4, 0x55)]);
}

#[test]
fn test_extern_handler_is_called_from_guest() {
    let mut fx = setup();
    let image = TempImage::new(&[
        asm::mflr(0),
        asm::stwu(1, -16, 1),
        asm::stw(0, 20, 1),
        asm::bl(0x20000 - 0x1000C),
        asm::addi(3, 3, 1),
        asm::lwz(0, 20, 1),
        asm::addi(1, 1, 16),
        asm::mtlr(0),
        asm::blr(),
    ]);
    fx.processor.load_raw_binary(image.path(), BASE).unwrap();

    let mut state = thread(&fx.processor);
    assert_eq!(
        fx.processor.execute(&mut state, BASE).unwrap_err(),
        ExecError::Dispatch { address: 0x20000 }
    );

    fx.processor
        .register_extern(
            0x20000,
            Arc::new(|state: &mut ThreadState| -> Result<(), ExecError> {
                let doubled = state.arg(0) * 2;
                state.set_return(doubled);
                Ok(())
            }),
        )
        .unwrap();
    let mut state = thread(&fx.processor);
    assert_eq!(fx.processor.call(&mut state, BASE, &[5]).unwrap(), 11);

    // Guest code cannot be turned into an extern
    assert!(matches!(
        fx.processor
            .register_extern(BASE, Arc::new(|_: &mut ThreadState| Ok::<(), ExecError>(()))),
        Err(Error::ExternConflict { address: BASE })
    ));
}

struct TestContainer {
    code: Vec<u8>,
    segments: Vec<Segment>,
}

impl TestContainer {
    const BASE: u32 = 0x30000;

    fn new() -> Self {
        let words = [
            asm::mflr(0),
            asm::stwu(1, -16, 1),
            asm::stw(0, 20, 1),
            asm::bl(0x34),
            asm::lwz(0, 20, 1),
            asm::addi(1, 1, 16),
            asm::mtlr(0),
            asm::blr(),
            // double
            asm::add(3, 3, 3),
            asm::blr(),
        ];
        Self {
            code: asm::assemble(&words),
            segments: vec![
                Segment {
                    address: Self::BASE,
                    size: 0x100,
                    permissions: Permissions::READ | Permissions::EXECUTE,
                },
                Segment {
                    address: Self::BASE + 0x100,
                    size: 0x100,
                    permissions: Permissions::READ | Permissions::WRITE,
                },
            ],
        }
    }
}

impl Container for TestContainer {
    fn entry_point(&self) -> u32 {
        Self::BASE
    }

    fn segments(&self) -> &[Segment] {
        &self.segments
    }

    fn symbol_hints(&self) -> Vec<SymbolHint> {
        vec![
            SymbolHint::function(Self::BASE + 0x20, "double"),
            SymbolHint::import(Self::BASE + 0x40, "host_add", 4),
            SymbolHint::variable(Self::BASE + 0x100, "counter"),
        ]
    }

    fn place(&self, memory: &Memory) -> Result<(), MemoryError> {
        memory.fill(Self::BASE, 0x200, 0)?;
        memory.copy_in(Self::BASE, &self.code)
    }
}

#[test]
fn test_container_module_with_hints() {
    let mut fx = setup();
    fx.processor
        .load_container_module("container", "container.bin", &TestContainer::new())
        .unwrap();
    let module = &fx.processor.modules()[0];
    assert_eq!(module.range(), 0x30000..0x30200);

    let double = fx.processor.get_function(0x30020).unwrap();
    assert_eq!(double.name(), "double");
    assert_eq!(double.status(), FunctionStatus::Defined);
    assert_eq!(
        fx.processor.get_function(0x30100).unwrap_err(),
        ExecError::NotAFunction { address: 0x30100 }
    );

    let mut state = thread(&fx.processor);
    assert_eq!(
        fx.processor.execute(&mut state, 0x30000).unwrap_err(),
        ExecError::UnresolvedExtern { address: 0x30040 }
    );

    fx.processor
        .register_extern(
            0x30040,
            Arc::new(|state: &mut ThreadState| -> Result<(), ExecError> {
                let sum = state.arg(0) + 100;
                state.set_return(sum);
                Ok(())
            }),
        )
        .unwrap();
    let mut state = thread(&fx.processor);
    assert_eq!(fx.processor.execute_with_arg(&mut state, 0x30000, 1), 101);
    assert_eq!(fx.processor.execute_with_arg(&mut state, 0x30020, 21), 42);

    let mut dump = Vec::new();
    fx.processor.dump_symbols(&mut dump).unwrap();
    let dump = String::from_utf8(dump).unwrap();
    assert!(dump.contains("double"));
    assert!(dump.contains("host_add"));
    assert!(dump.contains("00030100 -------- data counter"));
}

#[test]
fn test_concurrent_callers_compile_once() {
    let mut fx = setup();
    let image = TempImage::new(&indirect_caller());
    fx.processor.load_raw_binary(image.path(), BASE).unwrap();
    assert_eq!(fx.stats.compiled(), 1);

    let processor = &fx.processor;
    std::thread::scope(|scope| {
        for i in 0..8u64 {
            scope.spawn(move || {
                let mut state = processor.alloc_thread(0x4000, 0).unwrap();
                let target = if i % 2 == 0 { BASE } else { BASE + 0x40 };
                assert_eq!(processor.execute_with_arg(&mut state, target, i), i + 1);
                processor.dealloc_thread(state);
            });
        }
    });

    assert_eq!(fx.stats.compiled(), 2);
    assert_eq!(fx.processor.modules()[0].analysis_count(), 2);
}

#[test]
fn test_function_pointer_runs_guest_code() {
    let mut fx = setup();
    let image = TempImage::new(&indirect_caller());
    fx.processor.load_raw_binary(image.path(), BASE).unwrap();

    let entry = fx.processor.get_function_pointer(BASE).unwrap();
    let mut state = thread(&fx.processor);
    state.ppc.r[3] = 9;
    state.ppc.lr = RETURN_SENTINEL as u64;
    (*entry)(&mut state, &fx.processor).unwrap();
    assert_eq!(state.return_value(), 10);

    assert!(fx.processor.get_function_pointer(0xFFFF_FFFF).is_none());
}

#[test]
fn test_execute_at_address_inside_function() {
    let mut fx = setup();
    let image = TempImage::new(&[asm::addi(3, 3, 1), asm::addi(3, 3, 1), asm::blr()]);
    fx.processor.load_raw_binary(image.path(), BASE).unwrap();

    let mut state = thread(&fx.processor);
    assert_eq!(fx.processor.execute_with_arg(&mut state, BASE, 0), 2);
    assert_eq!(fx.processor.execute_with_arg(&mut state, BASE + 4, 0), 1);

    let entry = fx.processor.get_function_pointer(BASE + 4).unwrap();
    state.ppc.r[3] = 10;
    state.ppc.lr = RETURN_SENTINEL as u64;
    (*entry)(&mut state, &fx.processor).unwrap();
    assert_eq!(state.return_value(), 11);
}

#[test]
fn test_tail_call_loop_runs_without_nesting() {
    let mut fx = setup();
    // Counts r3 down to zero, jumping through a stub at BASE + 0x20 each round
    let mut words = vec![
        asm::addi(3, 3, -1),
        asm::cmpwi(0, 3, 0),
        asm::beq(0, 8),
        asm::b(0x20 - 12),
        asm::blr(),
    ];
    words.resize(8, 0);
    words.push(asm::b(-0x20));
    let image = TempImage::new(&words);
    fx.processor.load_raw_binary(image.path(), BASE).unwrap();

    let mut state = thread(&fx.processor);
    assert_eq!(fx.processor.call(&mut state, BASE, &[100_000]), Ok(0));
    assert_eq!(state.ppc.lr, RETURN_SENTINEL as u64);
}

#[test]
fn test_unload_module() {
    let mut fx = setup();
    let image = TempImage::new(&indirect_caller());
    fx.processor.load_raw_binary(image.path(), BASE).unwrap();
    let mut state = thread(&fx.processor);
    assert_eq!(fx.processor.execute_with_arg(&mut state, BASE, 1), 2);
    assert_eq!(fx.stats.live(), 2);

    fx.processor.unload_module(BASE).unwrap();
    assert_eq!(fx.stats.live(), 0);
    assert!(fx.processor.symbols().unwrap().is_empty());
    assert_eq!(
        fx.processor.get_function(BASE).unwrap_err(),
        ExecError::Dispatch { address: BASE }
    );
    assert!(matches!(
        fx.processor.unload_module(BASE),
        Err(Error::NoSuchModule(BASE))
    ));

    // The range can be claimed again
    fx.processor.load_raw_binary(image.path(), BASE).unwrap();
}

#[test]
fn test_teardown_releases_code_and_memory() {
    let fx = setup();
    let Setup {
        mut processor,
        memory,
        stats,
        hooks,
    } = fx;
    drop(hooks);
    assert_eq!(Arc::strong_count(&memory), 3);

    let first = TempImage::new(&indirect_caller());
    let second = TempImage::new(&[asm::li(3, 3), asm::blr()]);
    processor.load_raw_binary(first.path(), BASE).unwrap();
    processor.load_raw_binary(second.path(), 0x20000).unwrap();

    let mut state = thread(&processor);
    assert_eq!(processor.execute_with_arg(&mut state, BASE, 1), 2);
    processor.dealloc_thread(state);
    assert_eq!(stats.live(), 3);

    drop(processor);
    assert_eq!(stats.live(), 0);
    assert_eq!(Arc::strong_count(&memory), 1);
}
