use crate::fs::FileError;
use core::fmt;

/// Why a page fault or user access could not be resolved. The process that
/// caused it is killed; the kernel carries on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// No page covers the address and it is not a plausible stack access
    BadAddress,
    /// The address is in kernel space
    KernelAddress,
    /// A write to a read-only page
    ReadOnly,
    /// Reading the page's contents from its file failed
    Io(FileError),
    /// The hardware mapping could not be installed
    MapFailed,
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadAddress => write!(f, "address is not mapped"),
            Self::KernelAddress => write!(f, "address belongs to the kernel"),
            Self::ReadOnly => write!(f, "page is read-only"),
            Self::Io(e) => write!(f, "cannot load page: {e}"),
            Self::MapFailed => write!(f, "cannot install page mapping"),
        }
    }
}

impl core::error::Error for FaultError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FileError> for FaultError {
    fn from(e: FileError) -> Self {
        Self::Io(e)
    }
}

/// Reasons `mmap` refuses a request. None of these affect the caller beyond
/// the failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmapError {
    NullAddress,
    Unaligned,
    EmptyFile,
    /// Some page of the range is already in use
    Overlap,
    /// The range reaches into kernel space
    KernelAddress,
    /// The file could not be opened again for the mapping
    Reopen,
}

impl fmt::Display for MmapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NullAddress => write!(f, "cannot map at address 0"),
            Self::Unaligned => write!(f, "address is not page aligned"),
            Self::EmptyFile => write!(f, "file is empty"),
            Self::Overlap => write!(f, "range overlaps existing pages"),
            Self::KernelAddress => write!(f, "range reaches kernel space"),
            Self::Reopen => write!(f, "cannot reopen file"),
        }
    }
}

impl core::error::Error for MmapError {}
