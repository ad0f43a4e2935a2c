use super::{File, FileError, Result};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A read-only file held in kernel memory.
///
/// Every handle to the same file shares the contents and an open-handle
/// count, so dropping a handle is observable through [`MemFile::open_handles`].
pub struct MemFile {
    inner: Arc<Shared>,
}

struct Shared {
    data: Arc<[u8]>,
    open: AtomicUsize,
    failing: AtomicBool,
}

impl MemFile {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Shared {
                data: data.into(),
                open: AtomicUsize::new(1),
                failing: AtomicBool::new(false),
            }),
        })
    }

    /// Number of live handles to this file, including this one.
    pub fn open_handles(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Make every later read through any handle fail with [`FileError::Io`].
    pub fn fail_reads(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        self.inner.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl File for MemFile {
    fn length(&self) -> u64 {
        self.inner.data.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(FileError::Io);
        }
        let data = &self.inner.data;
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn reopen(&self) -> Result<Arc<dyn File>> {
        self.inner.open.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemFile {
            inner: Arc::clone(&self.inner),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::read_full;

    #[test]
    fn reads_stop_at_end_of_file() {
        let file = MemFile::new(&b"hello world"[..]);
        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(6, &mut buf), Ok(5));
        assert_eq!(&buf[..5], b"world");
        assert_eq!(file.read_at(11, &mut buf), Ok(0));
        assert_eq!(read_full(&*file, 0, &mut buf), Ok(8));
    }

    #[test]
    fn reopen_shares_contents_and_counts_handles() {
        let file = MemFile::new(&b"abc"[..]);
        let other = file.reopen().unwrap();
        assert_eq!(file.open_handles(), 2);
        assert_eq!(other.length(), 3);
        drop(other);
        assert_eq!(file.open_handles(), 1);
    }

    #[test]
    fn injected_failures() {
        let file = MemFile::new(&b"abc"[..]);
        file.fail_reads(true);
        let mut buf = [0u8; 3];
        assert_eq!(file.read_at(0, &mut buf), Err(FileError::Io));
    }
}
