//! Demand paging for user processes.
//!
//! A [`Vm`] owns the user frame pool, the swap space and the supplemental
//! page table of every registered process. All of it is guarded by one
//! paging lock, so at most one fault, eviction or teardown is in flight at a
//! time. The only state touched outside the lock is the contents of pinned
//! frames, see [`Vm::pin`].

mod error;
mod fault;
pub mod frame_allocator;
pub mod mmap;
pub mod page_replacement;
pub mod spt;
pub mod user;


pub use error::{FaultError, MmapError};
pub use mmap::MapId;

use crate::block::Block;
use crate::fs::File;
use crate::paging::AddressSpace;
use crate::swapping::{SwapSlot, SwapSpace};
use crate::sync::mutex::Mutex;
use crate::threading::process::Pid;
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc};
use frame_allocator::{FrameId, FrameOwner, FramePool, UserPool};
use kidneyos_vm_shared::{
    mem::{pg_ofs, MAX_STACK_SIZE, OFFSET, STACK_SLACK, USER_FRAMES},
    sizes::SWAP_SLOTS,
};
use log::{debug, info};
use mmap::MmapTable;
use page_replacement::Fifo;
use spt::{PageSource, Residency, SptEntry, SupplementalPageTable};

/// Tunables of the pager. The defaults match the i386 layout the kernel
/// runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Number of frames in the user pool.
    pub user_frames: usize,
    /// Upper bound on swap slots; the device size may lower it further.
    pub swap_slots: usize,
    /// First kernel virtual address. User pages lie below it and the stack
    /// grows down from it.
    pub phys_base: usize,
    pub max_stack_size: usize,
    /// How far below the stack pointer an access still counts as stack.
    pub stack_slack: usize,
    /// Install every executable page writable, regardless of its segment.
    pub writable_exec_pages: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_frames: USER_FRAMES,
            swap_slots: SWAP_SLOTS,
            phys_base: OFFSET,
            max_stack_size: MAX_STACK_SIZE,
            stack_slack: STACK_SLACK,
            writable_exec_pages: true,
        }
    }
}

impl VmConfig {
    pub fn with_user_frames(self, user_frames: usize) -> Self {
        Self {
            user_frames,
            ..self
        }
    }

    pub fn with_swap_slots(self, swap_slots: usize) -> Self {
        Self { swap_slots, ..self }
    }

    pub fn with_max_stack_size(self, max_stack_size: usize) -> Self {
        assert_eq!(pg_ofs(max_stack_size), 0);
        Self {
            max_stack_size,
            ..self
        }
    }

    pub fn with_stack_slack(self, stack_slack: usize) -> Self {
        Self {
            stack_slack,
            ..self
        }
    }

    pub fn with_writable_exec_pages(self, writable_exec_pages: bool) -> Self {
        Self {
            writable_exec_pages,
            ..self
        }
    }

    /// Lowest address the stack may grow down to.
    pub fn stack_limit(&self) -> usize {
        self.phys_base - self.max_stack_size
    }

    pub fn is_user_vaddr(&self, vaddr: usize) -> bool {
        vaddr < self.phys_base
    }
}

/// Where a declared page is right now, as seen from outside the pager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    NotPopulated,
    Resident { paddr: usize },
    Swapped { slot: SwapSlot },
}

/// Everything the pager tracks for one process.
pub(crate) struct ProcessMemory {
    spt: SupplementalPageTable,
    mmaps: MmapTable,
    page_manager: Box<dyn AddressSpace>,
}

pub(crate) struct PagingState {
    frames: FramePool<Fifo>,
    swap: SwapSpace,
    processes: BTreeMap<Pid, ProcessMemory>,
}

pub struct Vm {
    config: VmConfig,
    pool: UserPool,
    state: Mutex<PagingState>,
}

fn process_memory(processes: &mut BTreeMap<Pid, ProcessMemory>, pid: Pid) -> &mut ProcessMemory {
    match processes.get_mut(&pid) {
        Some(process) => process,
        None => panic!("pid {pid} has no address space"),
    }
}

/// Gives back whatever `entry` holds: its frame and hardware mapping if
/// resident, its swap slot if swapped out.
fn release_entry(
    entry: SptEntry,
    frames: &mut FramePool<Fifo>,
    swap: &mut SwapSpace,
    page_manager: &mut dyn AddressSpace,
) {
    match entry.residency() {
        Residency::Resident(frame) => {
            page_manager.clear_page(entry.upage());
            frames.release(frame);
        }
        Residency::Swapped(slot) => swap.free_slot(slot),
        Residency::NotPopulated => {}
    }
}

impl PagingState {
    /// A frame for `owner`, evicting the oldest unpinned page if the pool is
    /// full. Panics if every frame is pinned.
    fn acquire_frame(&mut self, pool: &UserPool, owner: FrameOwner) -> FrameId {
        if let Some(frame) = self.frames.try_allocate(owner) {
            return frame;
        }

        let Some(victim) = self.frames.select_victim() else {
            panic!(
                "pid {}: no frame for {:#x}, all {} user frames are pinned",
                owner.pid,
                owner.upage,
                self.frames.len()
            );
        };
        self.evict(pool, victim);
        self.frames.reassign(victim, owner);
        victim
    }

    /// Moves the page in `frame` to swap and unmaps it. The frame stays
    /// allocated for the caller.
    fn evict(&mut self, pool: &UserPool, frame: FrameId) {
        let Some(owner) = self.frames.owner(frame) else {
            panic!("evicting frame {} which has no owner", frame.0);
        };
        let process = process_memory(&mut self.processes, owner.pid);
        let Some(entry) = process.spt.lookup_mut(owner.upage) else {
            panic!("pid {}: frame {} backs undeclared page {:#x}", owner.pid, frame.0, owner.upage);
        };
        assert_eq!(entry.residency, Residency::Resident(frame));

        process.page_manager.clear_page(owner.upage);
        let slot = self.swap.allocate_slot();
        // SAFETY: the paging lock is held and the frame is not pinned.
        self.swap.write_page(slot, unsafe { pool.frame_mut(frame) });
        entry.residency = Residency::Swapped(slot);

        debug!(
            "pid {}: evicted {:#x} from frame {} to swap slot {}",
            owner.pid, owner.upage, frame.0, slot.0
        );
    }
}

impl Vm {
    pub fn new(config: VmConfig, swap: Block) -> Self {
        let swap = SwapSpace::new(swap, config.swap_slots);
        info!(
            "VM: {} user frames, {} swap slots on {}",
            config.user_frames,
            swap.slots(),
            swap.device().get_name()
        );
        Self {
            config,
            pool: UserPool::new(config.user_frames),
            state: Mutex::new(PagingState {
                frames: FramePool::new(config.user_frames, Fifo::default()),
                swap,
                processes: BTreeMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Starts tracking pages for `pid`, whose hardware translations live in
    /// `page_manager`.
    pub fn register_process(&self, pid: Pid, page_manager: Box<dyn AddressSpace>) {
        let mut state = self.state.lock();
        let previous = state.processes.insert(
            pid,
            ProcessMemory {
                spt: SupplementalPageTable::new(),
                mmaps: MmapTable::default(),
                page_manager,
            },
        );
        assert!(previous.is_none(), "pid {pid} registered twice");
    }

    /// Declares `upage` unless a page is already declared there, checking and
    /// declaring under one lock hold.
    fn try_declare(&self, pid: Pid, upage: usize, source: PageSource, writable: bool) -> bool {
        assert!(
            self.config.is_user_vaddr(upage),
            "pid {pid}: declaring kernel page {upage:#x}"
        );
        let mut state = self.state.lock();
        process_memory(&mut state.processes, pid)
            .spt
            .try_declare(upage, source, writable)
            .is_some()
    }

    /// Declares a page that reads as zeros until first written.
    pub fn declare_zero_page(&self, pid: Pid, upage: usize, writable: bool) {
        if !self.try_declare_zero_page(pid, upage, writable) {
            panic!("pid {pid}: page {upage:#x} declared twice");
        }
    }

    /// Like [`Vm::declare_zero_page`], but returns `false` instead of
    /// declaring over an existing page.
    pub fn try_declare_zero_page(&self, pid: Pid, upage: usize, writable: bool) -> bool {
        self.try_declare(pid, upage, PageSource::Zero, writable)
    }

    /// Declares a page whose first `read_bytes` bytes come from `file` at
    /// `offset`; the rest of the page is zero.
    pub fn declare_exec_page(
        &self,
        pid: Pid,
        upage: usize,
        file: Arc<dyn File>,
        offset: u64,
        read_bytes: usize,
        writable: bool,
    ) {
        if !self.try_declare_exec_page(pid, upage, file, offset, read_bytes, writable) {
            panic!("pid {pid}: page {upage:#x} declared twice");
        }
    }

    /// Like [`Vm::declare_exec_page`], but returns `false` instead of
    /// declaring over an existing page.
    pub fn try_declare_exec_page(
        &self,
        pid: Pid,
        upage: usize,
        file: Arc<dyn File>,
        offset: u64,
        read_bytes: usize,
        writable: bool,
    ) -> bool {
        let source = PageSource::ExecImage {
            file,
            offset,
            read_bytes,
        };
        self.try_declare(
            pid,
            upage,
            source,
            writable || self.config.writable_exec_pages,
        )
    }

    /// Tears down the address space of an exiting process. Mappings go first
    /// so their files are closed before anything else of the process.
    pub fn destroy_all_pages(&self, pid: Pid) {
        let mut state = self.state.lock();
        let PagingState {
            frames,
            swap,
            processes,
        } = &mut *state;
        let Some(mut process) = processes.remove(&pid) else {
            panic!("pid {pid} has no address space");
        };

        let mappings = process.mmaps.take_all();
        for mapping in &mappings {
            mmap::unmap_pages(&mut process, mapping, frames, swap);
        }
        drop(mappings);

        let pages = process.spt.take_all();
        let count = pages.len();
        for entry in pages {
            release_entry(entry, frames, swap, process.page_manager.as_mut());
        }
        debug!("pid {pid}: released {count} pages");
    }

    /// Residency of the page covering `vaddr`, or `None` if no page is
    /// declared there.
    pub fn page_state(&self, pid: Pid, vaddr: usize) -> Option<PageState> {
        let mut state = self.state.lock();
        let entry = process_memory(&mut state.processes, pid).spt.lookup(vaddr)?;
        Some(match entry.residency() {
            Residency::NotPopulated => PageState::NotPopulated,
            Residency::Resident(frame) => PageState::Resident {
                paddr: self.pool.paddr(frame),
            },
            Residency::Swapped(slot) => PageState::Swapped { slot },
        })
    }

    /// The physical address `vaddr` is mapped to in the hardware page table.
    pub fn translate(&self, pid: Pid, vaddr: usize) -> Option<usize> {
        let mut state = self.state.lock();
        process_memory(&mut state.processes, pid)
            .page_manager
            .get_page(vaddr)
    }

    /// Whether the hardware mapping for `vaddr` lets the user write.
    pub fn is_mapped_writable(&self, pid: Pid, vaddr: usize) -> bool {
        let mut state = self.state.lock();
        process_memory(&mut state.processes, pid)
            .page_manager
            .is_writable(vaddr)
    }

    pub fn declared_pages(&self, pid: Pid) -> usize {
        let mut state = self.state.lock();
        process_memory(&mut state.processes, pid).spt.len()
    }

    pub fn free_frames(&self) -> usize {
        self.state.lock().frames.free_frames()
    }

    pub fn free_swap_slots(&self) -> usize {
        self.state.lock().swap.free_slots()
    }

    /// Whether the frame at physical address `paddr` is pinned.
    pub fn is_pinned(&self, paddr: usize) -> bool {
        let Some(frame) = self.pool.frame_at(paddr) else {
            return false;
        };
        self.state.lock().frames.is_pinned(frame)
    }
}
