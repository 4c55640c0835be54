// ppcx - PowerPC dynamic binary translator
//
// Loads a big-endian PowerPC image, runs one function on a fresh guest thread
// and prints the value it returns in r3.
//
// Usage:
//   ppcx code.bin --load-address 0x10000 --arg 5
//   ppcx program.elf --dump-symbols -v

use anyhow::{Context, Result};
use clap::Parser;
use ppcx::{
    elf, logging, BackendConfig, Memory, MemoryConfig, Processor, RegisterHooks, ThreadedBackend,
};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Guest stack for the main thread
const STACK_SIZE: u32 = 0x10000;
/// Guest bytes reserved for the main thread's block (r13)
const THREAD_BLOCK_SIZE: u32 = 0x1000;

#[derive(Parser, Debug)]
#[command(name = "ppcx")]
#[command(about = "Big-endian PowerPC dynamic binary translator")]
#[command(version)]
struct Args {
    /// Raw binary or PowerPC ELF image
    image: PathBuf,

    /// Guest address a raw binary is copied to
    #[arg(long, default_value = "0x10000", value_parser = parse_number::<u32>)]
    load_address: u32,

    /// Function to run (defaults to the image entry point)
    #[arg(long, value_parser = parse_number::<u32>)]
    entry: Option<u32>,

    /// Value passed in r3
    #[arg(long, default_value = "0", value_parser = parse_number::<u64>)]
    arg: u64,

    /// Guest memory size in bytes
    #[arg(long, default_value = "0x4000000", value_parser = parse_number::<usize>)]
    memory_size: usize,

    /// Print the symbol table after running
    #[arg(long)]
    dump_symbols: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Decimal or `0x`-prefixed hexadecimal
fn parse_number<T>(text: &str) -> Result<T, String>
where
    T: TryFrom<u64>,
{
    let value = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>(),
    }
    .map_err(|e| format!("{}: {}", text, e))?;
    T::try_from(value).map_err(|_| format!("{} is out of range", text))
}

/// Hardware register window without a device behind it: reads as zero,
/// writes are logged
struct LoggingRegisterHooks;

impl RegisterHooks for LoggingRegisterHooks {
    fn read_register(&self, index: u32) -> u64 {
        debug!("hardware read r{}", index);
        0
    }

    fn write_register(&self, index: u32, value: u64) {
        debug!("hardware write r{} = {:#x}", index, value);
    }
}

fn is_elf_file(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 4];
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let read = file.read(&mut magic).context("Failed to read image header")?;
    Ok(read == magic.len() && elf::is_elf(&magic))
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose).map_err(|e| anyhow::anyhow!(e))?;

    let memory_config = MemoryConfig {
        size: args.memory_size,
        heap_start: (args.memory_size / 2) as u32,
    };
    let memory = Memory::new(&memory_config).context("Failed to create guest memory")?;

    let backend = ThreadedBackend::new(BackendConfig::default());
    let mut processor = Processor::new(memory.clone(), Box::new(backend));
    processor.set_register_hooks(Arc::new(LoggingRegisterHooks));
    processor.setup().context("Processor setup failed")?;

    if is_elf_file(&args.image)? {
        processor
            .load_elf_module(&args.image)
            .context("Failed to load ELF image")?;
    } else {
        processor
            .load_raw_binary(&args.image, args.load_address)
            .context("Failed to load raw binary")?;
    }

    let entry = match args.entry {
        Some(entry) => entry,
        None => processor
            .modules()
            .first()
            .map(|module| module.entry_point())
            .context("No module loaded")?,
    };

    let thread_block = memory
        .heap_alloc(THREAD_BLOCK_SIZE, 0x10)
        .context("Failed to allocate thread block")?;
    let mut state = processor
        .alloc_thread(STACK_SIZE, thread_block)
        .context("Failed to allocate guest thread")?;

    let result = processor.call(&mut state, entry, &[args.arg]);
    processor.dealloc_thread(state);

    if args.dump_symbols {
        let stdout = std::io::stdout();
        processor
            .dump_symbols(&mut stdout.lock())
            .context("Failed to write symbols")?;
    }

    let value = result.with_context(|| format!("Execution at {:#010x} failed", entry))?;
    println!("r3 = {:#x} ({})", value, value as i64);
    Ok(())
}
