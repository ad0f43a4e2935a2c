//! The user frame pool and its core map.
//!
//! Frame contents live in [`UserPool`], which sits outside the paging lock so
//! that a pinned frame can be copied into or out of without holding it. All
//! bookkeeping (who owns a frame, whether it is pinned, eviction order) lives
//! in [`FramePool`], which is only ever touched under the paging lock.

use super::page_replacement::PageReplacementPolicy;
use crate::threading::process::Pid;
use alloc::boxed::Box;
use arbitrary_int::{u15, Number};
use bitbybit::bitfield;
use core::cell::UnsafeCell;
use kidneyos_vm_shared::mem::{PAGE_FRAME_SIZE, USER_POOL_BASE};

/// One frame of the core map. Pins from every thread of a process may stack
/// on the same frame.
#[bitfield(u16, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    #[bits(1..=15, rw)]
    pin_count: u15,
}

impl CoreMapEntry {
    pub fn pinned(self) -> bool {
        self.pin_count().value() != 0
    }
}

/// Index of a frame in the user pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub usize);

/// The user page a frame currently backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOwner {
    pub pid: Pid,
    pub upage: usize,
}

#[repr(C, align(4096))]
struct FrameBytes(UnsafeCell<[u8; PAGE_FRAME_SIZE]>);

/// Backing memory of the user frames.
pub struct UserPool {
    frames: Box<[FrameBytes]>,
}

// SAFETY: a frame's bytes are only accessed by the holder of the paging lock,
// or by the thread that pinned the frame while the pin is held. Eviction and
// teardown both require the lock and skip pinned frames.
unsafe impl Sync for UserPool {}

impl UserPool {
    pub fn new(frames: usize) -> Self {
        Self {
            frames: (0..frames)
                .map(|_| FrameBytes(UnsafeCell::new([0; PAGE_FRAME_SIZE])))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Physical address of `frame`.
    pub fn paddr(&self, frame: FrameId) -> usize {
        USER_POOL_BASE + frame.0 * PAGE_FRAME_SIZE
    }

    /// The frame whose physical address range contains `paddr`.
    pub fn frame_at(&self, paddr: usize) -> Option<FrameId> {
        let index = paddr.checked_sub(USER_POOL_BASE)? / PAGE_FRAME_SIZE;
        (index < self.frames.len()).then_some(FrameId(index))
    }

    /// Raw pointer to the first byte of `frame`.
    pub fn frame_ptr(&self, frame: FrameId) -> *mut u8 {
        self.frames[frame.0].0.get().cast()
    }

    /// # Safety
    ///
    /// The caller must hold the paging lock, or have pinned `frame`, and must
    /// not create another reference to the same frame while this one lives.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn frame_mut(&self, frame: FrameId) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.frame_ptr(frame), PAGE_FRAME_SIZE)
    }
}

/// Bookkeeping for every user frame.
pub struct FramePool<P: PageReplacementPolicy> {
    core_map: Box<[CoreMapEntry]>,
    owners: Box<[Option<FrameOwner>]>,
    policy: P,
    frames_allocated: usize,
    /// Next frame number to start searching for a free frame.
    position: usize,
}

impl<P: PageReplacementPolicy> FramePool<P> {
    pub fn new(frames: usize, policy: P) -> Self {
        Self {
            core_map: alloc::vec![CoreMapEntry::DEFAULT; frames].into_boxed_slice(),
            owners: alloc::vec![None; frames].into_boxed_slice(),
            policy,
            frames_allocated: 0,
            position: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.core_map.len()
    }

    pub fn free_frames(&self) -> usize {
        self.core_map.len() - self.frames_allocated
    }

    /// Takes a free frame for `owner`, searching next-fit from the last
    /// allocation. Returns `None` when every frame is in use.
    pub fn try_allocate(&mut self, owner: FrameOwner) -> Option<FrameId> {
        let total = self.core_map.len();
        if self.frames_allocated == total {
            return None;
        }

        let index = (0..total)
            .map(|i| (self.position + i) % total)
            .find(|&i| !self.core_map[i].allocated())?;

        self.core_map[index] = self.core_map[index].with_allocated(true);
        self.owners[index] = Some(owner);
        self.frames_allocated += 1;
        self.position = (index + 1) % total;

        let frame = FrameId(index);
        self.policy.frame_assigned(frame);
        Some(frame)
    }

    /// Picks the next unpinned frame to evict and withdraws it from the
    /// replacement order. The frame stays allocated.
    pub fn select_victim(&mut self) -> Option<FrameId> {
        let core_map = &self.core_map;
        self.policy
            .select_victim(&|frame: FrameId| !core_map[frame.0].pinned())
    }

    /// Hands an evicted frame to its new owner.
    pub fn reassign(&mut self, frame: FrameId, owner: FrameOwner) {
        assert!(self.core_map[frame.0].allocated(), "reassigning a free frame");
        debug_assert!(!self.core_map[frame.0].pinned());
        self.owners[frame.0] = Some(owner);
        self.policy.frame_assigned(frame);
    }

    /// Returns `frame` to the free pool. Any pins on it are dropped.
    pub fn release(&mut self, frame: FrameId) {
        assert!(
            self.core_map[frame.0].allocated(),
            "releasing free frame {}",
            frame.0
        );
        self.core_map[frame.0] = CoreMapEntry::DEFAULT;
        self.owners[frame.0] = None;
        self.frames_allocated -= 1;
        self.policy.frame_released(frame);
    }

    pub fn owner(&self, frame: FrameId) -> Option<FrameOwner> {
        self.owners[frame.0]
    }

    pub fn is_pinned(&self, frame: FrameId) -> bool {
        self.core_map[frame.0].pinned()
    }

    /// Pins nest: a frame stays pinned until every pin has been released.
    pub fn pin(&mut self, frame: FrameId) {
        let entry = self.core_map[frame.0];
        assert!(entry.allocated(), "pinning free frame {}", frame.0);
        let count = entry.pin_count().value();
        assert!(count < u15::MAX.value(), "frame {} pinned too often", frame.0);
        self.core_map[frame.0] = entry.with_pin_count(u15::new(count + 1));
    }

    pub fn unpin(&mut self, frame: FrameId) {
        let entry = self.core_map[frame.0];
        let count = entry.pin_count().value();
        assert!(count > 0, "unpinning frame {} which is not pinned", frame.0);
        self.core_map[frame.0] = entry.with_pin_count(u15::new(count - 1));
    }
}
