// elf.rs - ELF container for big-endian PowerPC images
//
// Uses goblin for parsing; keeps the loadable segments' file bytes so the
// image can be placed after the source buffer is gone.

use crate::container::{Container, Permissions, Segment, SymbolHint};
use crate::memory::{Memory, MemoryError};
use crate::symbol::SymbolKind;
use goblin::elf::{header, program_header, sym, Elf};
use thiserror::Error;
use tracing::debug;

/// ELF magic number
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

#[derive(Debug, Error)]
pub enum ElfError {
    #[error("invalid ELF: {0}")]
    Parse(#[from] goblin::error::Error),

    #[error("not a PowerPC binary (e_machine={0:#x})")]
    Machine(u16),

    #[error("little-endian PowerPC images are not supported")]
    LittleEndian,

    #[error("segment at {address:#x} does not fit the 32-bit guest space")]
    OutOfRange { address: u64 },

    #[error("segment at {address:#010x} overruns the file")]
    Truncated { address: u32 },

    #[error("no loadable segments")]
    NoSegments,
}

/// Is `data` an ELF image?
pub fn is_elf(data: &[u8]) -> bool {
    data.starts_with(&ELF_MAGIC)
}

/// A parsed PowerPC executable
#[derive(Debug, Clone)]
pub struct ElfContainer {
    entry: u32,
    segments: Vec<Segment>,
    /// File bytes of each segment, parallel to `segments`
    images: Vec<Vec<u8>>,
    hints: Vec<SymbolHint>,
}

impl ElfContainer {
    /// Parse ELF and extract what loading needs
    pub fn parse(data: &[u8]) -> Result<Self, ElfError> {
        let elf = Elf::parse(data)?;

        // Verify PowerPC architecture
        let machine = elf.header.e_machine;
        if machine != header::EM_PPC && machine != header::EM_PPC64 {
            return Err(ElfError::Machine(machine));
        }
        if elf.little_endian {
            return Err(ElfError::LittleEndian);
        }

        let mut segments = Vec::new();
        let mut images = Vec::new();
        for ph in elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == program_header::PT_LOAD && ph.p_memsz > 0)
        {
            let address =
                u32::try_from(ph.p_vaddr).map_err(|_| ElfError::OutOfRange { address: ph.p_vaddr })?;
            let size = u32::try_from(ph.p_memsz)
                .ok()
                .filter(|size| address.checked_add(*size).is_some())
                .ok_or(ElfError::OutOfRange { address: ph.p_vaddr })?;

            let start = ph.p_offset as usize;
            let file_len = ph.p_filesz.min(ph.p_memsz) as usize;
            let bytes = start
                .checked_add(file_len)
                .and_then(|end| data.get(start..end))
                .ok_or(ElfError::Truncated { address })?;

            let mut permissions = Permissions::empty();
            if ph.p_flags & program_header::PF_X != 0 {
                permissions |= Permissions::EXECUTE;
            }
            if ph.p_flags & program_header::PF_W != 0 {
                permissions |= Permissions::WRITE;
            }
            if ph.p_flags & program_header::PF_R != 0 {
                permissions |= Permissions::READ;
            }

            segments.push(Segment {
                address,
                size,
                permissions,
            });
            images.push(bytes.to_vec());
        }
        if segments.is_empty() {
            return Err(ElfError::NoSegments);
        }

        // Named functions and objects from the static symbol table
        let hints = elf
            .syms
            .iter()
            .filter(|s| s.st_value != 0 && s.st_shndx != 0)
            .filter_map(|s| {
                let kind = match s.st_type() {
                    sym::STT_FUNC => SymbolKind::Function,
                    sym::STT_OBJECT => SymbolKind::Variable,
                    _ => return None,
                };
                let address = u32::try_from(s.st_value).ok()?;
                Some(SymbolHint {
                    address,
                    kind,
                    name: elf
                        .strtab
                        .get_at(s.st_name)
                        .filter(|name| !name.is_empty())
                        .map(str::to_string),
                    size: u32::try_from(s.st_size).ok().filter(|size| *size > 0),
                    external: false,
                })
            })
            .collect::<Vec<_>>();

        let entry =
            u32::try_from(elf.entry).map_err(|_| ElfError::OutOfRange { address: elf.entry })?;
        debug!(
            "ELF: entry {:#010x}, {} segments, {} symbols",
            entry,
            segments.len(),
            hints.len()
        );

        Ok(Self {
            entry,
            segments,
            images,
            hints,
        })
    }
}

impl Container for ElfContainer {
    fn entry_point(&self) -> u32 {
        self.entry
    }

    fn segments(&self) -> &[Segment] {
        &self.segments
    }

    fn symbol_hints(&self) -> Vec<SymbolHint> {
        self.hints.clone()
    }

    fn place(&self, memory: &Memory) -> Result<(), MemoryError> {
        for (segment, bytes) in self.segments.iter().zip(&self.images) {
            memory.copy_in(segment.address, bytes)?;
            let tail = segment.size as usize - bytes.len();
            if tail > 0 {
                memory.fill(segment.address + bytes.len() as u32, tail, 0)?;
            }
        }
        Ok(())
    }
}
