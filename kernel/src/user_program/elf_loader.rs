//! Lazy loading of ELF executables.
//!
//! Loading only validates the image and declares its pages. Each page of a
//! loadable segment becomes an executable-image page that reads its bytes
//! from the file on first fault, so a program that never touches part of its
//! image never reads it.

use super::elf::{
    ElfArchitecture, ElfEndianness, ElfHeader, ElfProgramHeader, ElfProgramType, ElfUsage,
};
use crate::fs::{read_full, File, FileError};
use crate::mem::Vm;
use crate::threading::process::Pid;
use alloc::{sync::Arc, vec};
use core::fmt;
use kidneyos_vm_shared::mem::{pg_ofs, pg_round_down, pg_round_up, PAGE_FRAME_SIZE};
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// Not a 32-bit ELF image, or truncated
    Malformed,
    UnsupportedEndianness,
    UnsupportedVersion,
    UnsupportedType,
    UnsupportedMachine,
    BadProgramHeaderSize,
    /// The image needs a dynamic loader
    DynamicSegment,
    Segment(ElfSegmentError),
}

// Error types that will arise when we try to validate segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfSegmentError {
    DifferentPageOffset,
    OffsetOutOfRange,
    MemSizeLesserThanFileSize,
    EmptyMemSize,
    VMRegionOutOfRange,
    VMRegionWrapAround,
    PageZeroMapping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    Read(FileError),
    Elf(ElfError),
    /// Two segments, or a segment and the stack, share the page at this
    /// address.
    SegmentOverlap(usize),
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(f, "not a 32-bit ELF executable"),
            Self::UnsupportedEndianness => write!(f, "unsupported endianness"),
            Self::UnsupportedVersion => write!(f, "unsupported ELF version"),
            Self::UnsupportedType => write!(f, "not an executable"),
            Self::UnsupportedMachine => write!(f, "not an x86 executable"),
            Self::BadProgramHeaderSize => write!(f, "unexpected program header size"),
            Self::DynamicSegment => write!(f, "dynamically linked executable"),
            Self::Segment(e) => write!(f, "invalid segment: {e:?}"),
        }
    }
}

impl core::error::Error for ElfError {}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read(e) => write!(f, "reading executable: {e}"),
            Self::Elf(e) => write!(f, "{e}"),
            Self::SegmentOverlap(page) => write!(f, "segments overlap at {page:#x}"),
        }
    }
}

impl core::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Read(e) => Some(e),
            Self::Elf(e) => Some(e),
            Self::SegmentOverlap(_) => None,
        }
    }
}

impl From<FileError> for LoadError {
    fn from(e: FileError) -> Self {
        Self::Read(e)
    }
}

impl From<ElfError> for LoadError {
    fn from(e: ElfError) -> Self {
        Self::Elf(e)
    }
}

/// Where a freshly loaded program starts running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedProgram {
    pub entry: usize,
    pub stack_pointer: usize,
}

/// Upper bound on program headers, to keep a corrupt count from making us
/// read the whole file.
const MAX_PROGRAM_HEADERS: u16 = 1024;

// Function to verify ELF header
fn verify_elf_header(header: &ElfHeader) -> Result<(), ElfError> {
    if header.endianness != ElfEndianness::Little {
        return Err(ElfError::UnsupportedEndianness);
    }
    if header.header_version != 1 || header.elf_version != 1 {
        return Err(ElfError::UnsupportedVersion);
    }
    if header.usage != ElfUsage::Executable {
        return Err(ElfError::UnsupportedType);
    }
    if header.architecture != ElfArchitecture::X86 {
        return Err(ElfError::UnsupportedMachine);
    }
    if usize::from(header.program_header_entry_size) != ElfProgramHeader::SIZE {
        return Err(ElfError::BadProgramHeaderSize);
    }
    if header.program_header_count > MAX_PROGRAM_HEADERS {
        return Err(ElfError::Malformed);
    }
    Ok(())
}

fn validate_segment(
    phdr: &ElfProgramHeader,
    file_len: u64,
    phys_base: usize,
) -> Result<(), ElfSegmentError> {
    let offset = phdr.file_offset as usize;
    let vaddr = phdr.virtual_address as usize;

    // p_offset and p_vaddr must have the same page offset.
    if pg_ofs(offset) != pg_ofs(vaddr) {
        return Err(ElfSegmentError::DifferentPageOffset);
    }

    // p_offset must point within FILE.
    if u64::from(phdr.file_offset) > file_len {
        return Err(ElfSegmentError::OffsetOutOfRange);
    }

    if phdr.memory_size < phdr.file_size {
        return Err(ElfSegmentError::MemSizeLesserThanFileSize);
    }

    if phdr.memory_size == 0 {
        return Err(ElfSegmentError::EmptyMemSize);
    }

    // The region must start and end in user space without wrapping.
    let end = vaddr
        .checked_add(phdr.memory_size as usize)
        .ok_or(ElfSegmentError::VMRegionWrapAround)?;
    if vaddr >= phys_base || end > phys_base {
        return Err(ElfSegmentError::VMRegionOutOfRange);
    }

    // Disallow mapping page 0.
    if vaddr < PAGE_FRAME_SIZE {
        return Err(ElfSegmentError::PageZeroMapping);
    }

    Ok(())
}

/// Reads exactly `buf.len()` bytes at `offset`; a short file is malformed.
fn read_exact(file: &dyn File, offset: u64, buf: &mut [u8]) -> Result<(), LoadError> {
    if read_full(file, offset, buf)? != buf.len() {
        return Err(ElfError::Malformed.into());
    }
    Ok(())
}

/// Declares the pages of one `PT_LOAD` segment.
fn load_segment(
    vm: &Vm,
    pid: Pid,
    file: &Arc<dyn File>,
    phdr: &ElfProgramHeader,
) -> Result<(), LoadError> {
    let vaddr = phdr.virtual_address as usize;
    let page_offset = pg_ofs(vaddr);
    let mut read_bytes = if phdr.file_size > 0 {
        page_offset + phdr.file_size as usize
    } else {
        0
    };
    let mut zero_bytes = pg_round_up(page_offset + phdr.memory_size as usize) - read_bytes;

    let mut upage = pg_round_down(vaddr);
    let mut offset = u64::from(phdr.file_offset) - page_offset as u64;
    while read_bytes > 0 || zero_bytes > 0 {
        let page_read_bytes = read_bytes.min(PAGE_FRAME_SIZE);
        if !vm.try_declare_exec_page(
            pid,
            upage,
            Arc::clone(file),
            offset,
            page_read_bytes,
            phdr.writable,
        ) {
            return Err(LoadError::SegmentOverlap(upage));
        }

        read_bytes -= page_read_bytes;
        zero_bytes -= PAGE_FRAME_SIZE - page_read_bytes;
        upage += PAGE_FRAME_SIZE;
        offset += page_read_bytes as u64;
    }
    Ok(())
}

/// Declares the image in `file` and an initial stack page in `pid`'s address
/// space. Nothing past the headers is read.
///
/// On error some pages may already be declared; the caller is expected to
/// tear the process down with [`Vm::destroy_all_pages`].
pub fn load_elf(vm: &Vm, pid: Pid, file: Arc<dyn File>) -> Result<LoadedProgram, LoadError> {
    let mut header_bytes = [0u8; ElfHeader::SIZE];
    read_exact(file.as_ref(), 0, &mut header_bytes)?;
    let (_, header) = ElfHeader::parse(&header_bytes).map_err(|_| ElfError::Malformed)?;
    verify_elf_header(&header)?;

    let count = usize::from(header.program_header_count);
    let mut table = vec![0u8; count * ElfProgramHeader::SIZE];
    read_exact(
        file.as_ref(),
        u64::from(header.program_headers_offset),
        &mut table,
    )?;

    let file_len = file.length();
    let phys_base = vm.config().phys_base;
    for entry in table.chunks_exact(ElfProgramHeader::SIZE) {
        let (_, phdr) = ElfProgramHeader::parse(entry, header.endianness.to_nom())
            .map_err(|_| ElfError::Malformed)?;
        match phdr.program_type {
            ElfProgramType::Load => {
                validate_segment(&phdr, file_len, phys_base).map_err(ElfError::Segment)?;
                load_segment(vm, pid, &file, &phdr)?;
                debug!(
                    "pid {pid}: segment at {:#x}, {:#x} bytes ({:#x} from file)",
                    phdr.virtual_address, phdr.memory_size, phdr.file_size
                );
            }
            ElfProgramType::Dynamic | ElfProgramType::Interpret | ElfProgramType::Shlib => {
                return Err(ElfError::DynamicSegment.into());
            }
            _ => {}
        }
    }

    let stack_page = phys_base - PAGE_FRAME_SIZE;
    if !vm.try_declare_zero_page(pid, stack_page, true) {
        return Err(LoadError::SegmentOverlap(stack_page));
    }

    Ok(LoadedProgram {
        entry: header.program_entry as usize,
        stack_pointer: phys_base,
    })
}
