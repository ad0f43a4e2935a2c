//! The file collaborator the pager reads executables and mapped files through.
//!
//! Paging only ever reads files, so there is no write path. Closing a file
//! is dropping its last handle.

pub mod memfile;

pub use memfile::MemFile;

use alloc::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileError {
    /// The underlying device reported an error
    Io,
    /// The file ended before the bytes a page needs
    ShortRead,
    /// The file could not be opened a second time
    Reopen,
}

impl core::fmt::Display for FileError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Io => write!(f, "i/o error"),
            Self::ShortRead => write!(f, "unexpected end of file"),
            Self::Reopen => write!(f, "cannot reopen file"),
        }
    }
}

impl core::error::Error for FileError {}

pub type Result<T> = core::result::Result<T, FileError>;

/// An open regular file.
pub trait File: Send + Sync {
    /// Size of the file in bytes.
    fn length(&self) -> u64;
    /// Read from the file into `buf` starting at `offset`.
    ///
    /// Returns the number of bytes read, which is short only at end of file.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
    /// Open an independent handle to the same file.
    fn reopen(&self) -> Result<Arc<dyn File>>;
}

/// Fill as much of `buf` as the file holds past `offset`.
pub fn read_full(file: &dyn File, offset: u64, buf: &mut [u8]) -> Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        let n = file.read_at(offset + done as u64, &mut buf[done..])?;
        if n == 0 {
            break;
        }
        done += n;
    }
    Ok(done)
}
