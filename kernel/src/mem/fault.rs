//! Resolving faults: finding or growing the page, getting it a frame, filling
//! the frame and mapping it. Pinning for system-call I/O builds on the same
//! path.

use super::frame_allocator::{FrameId, FrameOwner, UserPool};
use super::spt::{PageSource, Residency};
use super::{process_memory, FaultError, PagingState, Vm, VmConfig};
use crate::fs::{read_full, FileError};
use crate::threading::process::Pid;
use alloc::vec::Vec;
use kidneyos_vm_shared::mem::{pg_round_down, PAGE_FRAME_SIZE};
use log::{debug, trace};

/// Whether an access to `vaddr` with the stack pointer at `esp` looks like the
/// stack growing: no lower than `stack_slack` bytes below `esp` (PUSHA checks
/// its whole frame before moving `esp`) and inside the stack region.
fn is_stack_access(config: &VmConfig, vaddr: usize, esp: usize) -> bool {
    config.is_user_vaddr(vaddr)
        && vaddr >= config.stack_limit()
        && vaddr.saturating_add(config.stack_slack) >= esp
}

/// Fills a fresh frame from the page's source.
fn populate(source: &PageSource, page: &mut [u8]) -> Result<(), FileError> {
    match source {
        PageSource::Zero => page.fill(0),
        PageSource::ExecImage {
            file,
            offset,
            read_bytes,
        } => {
            let (data, rest) = page.split_at_mut(*read_bytes);
            if read_full(file.as_ref(), *offset, data)? != *read_bytes {
                return Err(FileError::ShortRead);
            }
            rest.fill(0);
        }
        PageSource::MappedFile { file, offset, .. } => {
            let read = read_full(file.as_ref(), *offset, page)?;
            page[read..].fill(0);
        }
    }
    Ok(())
}

/// Page addresses spanned by `len` bytes at `start`.
pub(super) fn pages_spanned(start: usize, len: usize) -> impl Iterator<Item = usize> {
    let end = start.saturating_add(len);
    (pg_round_down(start)..end).step_by(PAGE_FRAME_SIZE)
}

impl PagingState {
    /// Makes the page covering `vaddr` resident and returns its frame. Grows
    /// the stack if `vaddr` is undeclared but looks like a stack access.
    pub(super) fn fault_in(
        &mut self,
        pool: &UserPool,
        config: &VmConfig,
        pid: Pid,
        vaddr: usize,
        esp: usize,
        for_write: bool,
    ) -> Result<FrameId, FaultError> {
        if !config.is_user_vaddr(vaddr) {
            return Err(FaultError::KernelAddress);
        }

        let process = process_memory(&mut self.processes, pid);
        let grow_stack = || {
            is_stack_access(config, vaddr, esp).then(|| {
                debug!("pid {pid}: stack grows to {:#x}", pg_round_down(vaddr));
                (PageSource::Zero, true)
            })
        };
        let Some(entry) = process.spt.lookup_or_declare(vaddr, grow_stack) else {
            return Err(FaultError::BadAddress);
        };
        if for_write && !entry.writable() {
            return Err(FaultError::ReadOnly);
        }
        if let Residency::Resident(frame) = entry.residency() {
            return Ok(frame);
        }

        self.load_page(pool, pid, pg_round_down(vaddr))
    }

    /// Brings a declared, non-resident page into a frame and maps it.
    fn load_page(&mut self, pool: &UserPool, pid: Pid, upage: usize) -> Result<FrameId, FaultError> {
        let frame = self.acquire_frame(pool, FrameOwner { pid, upage });

        let PagingState {
            frames,
            swap,
            processes,
        } = self;
        let process = process_memory(processes, pid);
        let Some(entry) = process.spt.lookup_mut(upage) else {
            panic!("pid {pid}: page {upage:#x} vanished while acquiring a frame");
        };

        // SAFETY: the paging lock is held and the frame was just handed to
        // this page, so nothing else maps or pins it.
        let page = unsafe { pool.frame_mut(frame) };
        match entry.residency() {
            Residency::Swapped(slot) => {
                trace!("pid {pid}: {upage:#x} in from swap slot {}", slot.0);
                swap.read_page(slot, page);
            }
            Residency::NotPopulated => {
                trace!("pid {pid}: populating {upage:#x} from {:?}", entry.source());
                if let Err(e) = populate(entry.source(), page) {
                    frames.release(frame);
                    return Err(e.into());
                }
            }
            Residency::Resident(_) => panic!("pid {pid}: loading resident page {upage:#x}"),
        }

        if !process
            .page_manager
            .set_page(upage, pool.paddr(frame), entry.writable())
        {
            frames.release(frame);
            return Err(FaultError::MapFailed);
        }
        if let Residency::Swapped(slot) = entry.residency() {
            swap.free_slot(slot);
        }
        entry.residency = Residency::Resident(frame);
        Ok(frame)
    }
}

impl Vm {
    /// Resolves a not-present fault by `pid` at `fault_addr`. `esp` is the
    /// user stack pointer at the time of the fault. A fault on a page that is
    /// already resident succeeds without doing anything.
    pub fn page_fault(&self, pid: Pid, fault_addr: usize, esp: usize) -> Result<(), FaultError> {
        trace!("pid {pid}: page fault at {fault_addr:#x}, esp {esp:#x}");
        let mut state = self.state.lock();
        state
            .fault_in(&self.pool, &self.config, pid, fault_addr, esp, false)
            .map(drop)
    }

    /// Whether `pid` may access `vaddr`. An address that is not declared but
    /// looks like stack growth is declared as a new stack page.
    pub fn valid_address(&self, pid: Pid, vaddr: usize, esp: usize, for_write: bool) -> bool {
        if vaddr == 0 || !self.config.is_user_vaddr(vaddr) {
            return false;
        }

        let mut state = self.state.lock();
        let process = process_memory(&mut state.processes, pid);
        let grow_stack = || {
            is_stack_access(&self.config, vaddr, esp).then(|| {
                debug!("pid {pid}: stack grows to {:#x}", pg_round_down(vaddr));
                (PageSource::Zero, true)
            })
        };
        process
            .spt
            .lookup_or_declare(vaddr, grow_stack)
            .is_some_and(|entry| !for_write || entry.writable())
    }

    /// Faults in every page of `buffer..buffer + size` and pins them so they
    /// stay resident until [`Vm::unpin`]. Each page is faulted in and pinned
    /// under the same lock hold. On failure nothing stays pinned.
    pub fn pin(
        &self,
        pid: Pid,
        buffer: usize,
        size: usize,
        esp: usize,
        for_write: bool,
    ) -> Result<(), FaultError> {
        if size == 0 {
            return Ok(());
        }
        self.check_user_range(buffer, size)?;

        let mut state = self.state.lock();
        let mut pinned = Vec::new();
        for upage in pages_spanned(buffer, size) {
            let vaddr = upage.max(buffer);
            match state.fault_in(&self.pool, &self.config, pid, vaddr, esp, for_write) {
                Ok(frame) => {
                    state.frames.pin(frame);
                    pinned.push(frame);
                }
                Err(e) => {
                    for frame in pinned {
                        state.frames.unpin(frame);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Faults in the page covering `vaddr` and pins its frame.
    pub(super) fn pin_page(
        &self,
        pid: Pid,
        vaddr: usize,
        esp: usize,
        for_write: bool,
    ) -> Result<FrameId, FaultError> {
        let mut state = self.state.lock();
        let frame = state.fault_in(&self.pool, &self.config, pid, vaddr, esp, for_write)?;
        state.frames.pin(frame);
        Ok(frame)
    }

    pub(super) fn unpin_frame(&self, frame: FrameId) {
        self.state.lock().frames.unpin(frame);
    }

    /// Fails unless `len` bytes at `start` lie entirely below the kernel.
    pub(super) fn check_user_range(&self, start: usize, len: usize) -> Result<(), FaultError> {
        match start.checked_add(len) {
            Some(end) if end <= self.config.phys_base => Ok(()),
            _ => Err(FaultError::KernelAddress),
        }
    }

    /// Releases the pins taken by a successful [`Vm::pin`] of the same range.
    pub fn unpin(&self, pid: Pid, buffer: usize, size: usize) {
        if size == 0 {
            return;
        }

        let mut state = self.state.lock();
        let PagingState {
            frames, processes, ..
        } = &mut *state;
        let Some(process) = processes.get(&pid) else {
            return;
        };
        for upage in pages_spanned(buffer, size) {
            if let Some(frame) = process.spt.lookup(upage).and_then(|entry| entry.frame()) {
                frames.unpin(frame);
            }
        }
    }
}
