//! Copying between kernel buffers and user memory on behalf of system calls.
//!
//! Copies go one page at a time: the page is faulted in and pinned, copied
//! without the paging lock, then unpinned before the next one. A copy holds
//! at most one pin, whatever the length of the buffer.

use super::{FaultError, Vm};
use crate::threading::process::Pid;
use alloc::{vec, vec::Vec};
use core::ops::Range;
use kidneyos_vm_shared::mem::{pg_ofs, PAGE_FRAME_SIZE};

/// Splits `len` bytes at user address `start` into one piece per page: the
/// user address of the piece and the matching range of the kernel buffer.
fn pieces(start: usize, len: usize) -> impl Iterator<Item = (usize, Range<usize>)> {
    let mut done = 0;
    core::iter::from_fn(move || {
        if done == len {
            return None;
        }
        let vaddr = start + done;
        let n = (PAGE_FRAME_SIZE - pg_ofs(vaddr)).min(len - done);
        let range = done..done + n;
        done += n;
        Some((vaddr, range))
    })
}

impl Vm {
    /// Reads `len` bytes at `src` from `pid`'s address space, faulting pages
    /// in as needed.
    pub fn copy_from_user(
        &self,
        pid: Pid,
        src: usize,
        len: usize,
        esp: usize,
    ) -> Result<Vec<u8>, FaultError> {
        self.check_user_range(src, len)?;
        let mut bytes = vec![0; len];
        for (vaddr, range) in pieces(src, len) {
            let frame = self.pin_page(pid, vaddr, esp, false)?;
            // SAFETY: `frame` stays pinned until `unpin_frame`, so it is
            // neither evicted nor reused, and the piece does not pass the end
            // of the page.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.pool.frame_ptr(frame).add(pg_ofs(vaddr)),
                    bytes[range.clone()].as_mut_ptr(),
                    range.len(),
                );
            }
            self.unpin_frame(frame);
        }
        Ok(bytes)
    }

    /// Writes `bytes` to `dst` in `pid`'s address space. Fails with
    /// [`FaultError::ReadOnly`] if a page of the range is read-only; pages
    /// before it have been written by then.
    pub fn copy_to_user(
        &self,
        pid: Pid,
        dst: usize,
        bytes: &[u8],
        esp: usize,
    ) -> Result<(), FaultError> {
        self.check_user_range(dst, bytes.len())?;
        for (vaddr, range) in pieces(dst, bytes.len()) {
            let frame = self.pin_page(pid, vaddr, esp, true)?;
            // SAFETY: as in `copy_from_user`.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    bytes[range.clone()].as_ptr(),
                    self.pool.frame_ptr(frame).add(pg_ofs(vaddr)),
                    range.len(),
                );
            }
            self.unpin_frame(frame);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pieces_follow_page_boundaries() {
        let split: Vec<_> = pieces(0x1ff0, 0x1020).collect();
        assert_eq!(
            split,
            [
                (0x1ff0, 0..0x10),
                (0x2000, 0x10..0x1010),
                (0x3000, 0x1010..0x1020),
            ]
        );
    }

    #[test]
    fn single_piece_inside_a_page() {
        let split: Vec<_> = pieces(0x4010, 8).collect();
        assert_eq!(split, [(0x4010, 0..8)]);
    }

    #[test]
    fn nothing_to_copy() {
        assert_eq!(pieces(0x4000, 0).count(), 0);
    }
}
