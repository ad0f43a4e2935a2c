//! Memory-mapped files.
//!
//! A mapping reopens the file it was created from, so it outlives the
//! descriptor it was made through, and covers the file with one
//! [`PageSource::MappedFile`] page per page of file. Nothing is read until a
//! page is first touched.

use super::fault::pages_spanned;
use super::frame_allocator::FramePool;
use super::page_replacement::Fifo;
use super::spt::PageSource;
use super::{process_memory, release_entry, MmapError, PagingState, ProcessMemory, Vm};
use crate::fs::File;
use crate::swapping::SwapSpace;
use crate::threading::process::Pid;
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::fmt;
use kidneyos_vm_shared::mem::{pg_ofs, PAGE_FRAME_SIZE};
use log::debug;

/// Identifies a mapping within its process. Ids count up from 0 and are
/// never reused by the same process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapId(pub u32);

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) struct Mapping {
    id: MapId,
    /// The reopened handle, closed when the mapping is dropped.
    file: Arc<dyn File>,
    base: usize,
    len: usize,
}

impl Mapping {
    fn pages(&self) -> impl Iterator<Item = usize> {
        pages_spanned(self.base, self.len)
    }
}

#[derive(Default)]
pub(crate) struct MmapTable {
    mappings: BTreeMap<MapId, Mapping>,
    next_id: u32,
}

impl MmapTable {
    fn next_id(&self) -> MapId {
        MapId(self.next_id)
    }

    fn insert(&mut self, mapping: Mapping) {
        assert_eq!(mapping.id, self.next_id());
        self.next_id += 1;
        self.mappings.insert(mapping.id, mapping);
    }

    fn remove(&mut self, id: MapId) -> Option<Mapping> {
        self.mappings.remove(&id)
    }

    pub(super) fn take_all(&mut self) -> Vec<Mapping> {
        core::mem::take(&mut self.mappings).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }
}

/// Removes the pages of `mapping` from `process`, giving back their frames
/// and swap slots.
pub(super) fn unmap_pages(
    process: &mut ProcessMemory,
    mapping: &Mapping,
    frames: &mut FramePool<Fifo>,
    swap: &mut SwapSpace,
) {
    for upage in mapping.pages() {
        let Some(entry) = process.spt.remove(upage) else {
            continue;
        };
        debug_assert!(matches!(
            entry.source(),
            PageSource::MappedFile { mapping: id, file, .. }
                if *id == mapping.id && Arc::ptr_eq(file, &mapping.file)
        ));
        release_entry(entry, frames, swap, process.page_manager.as_mut());
    }
}

impl Vm {
    /// Maps all of `file` at `addr` in `pid`'s address space.
    ///
    /// The request fails without side effects if `addr` is null or unaligned,
    /// the file is empty, or any page of the range is already in use.
    pub fn mmap(&self, pid: Pid, file: &dyn File, addr: usize) -> Result<MapId, MmapError> {
        if addr == 0 {
            return Err(MmapError::NullAddress);
        }
        if pg_ofs(addr) != 0 {
            return Err(MmapError::Unaligned);
        }
        let len = match usize::try_from(file.length()) {
            Ok(0) => return Err(MmapError::EmptyFile),
            Ok(len) => len,
            Err(_) => return Err(MmapError::KernelAddress),
        };
        match addr.checked_add(len) {
            Some(end) if end <= self.config.phys_base => {}
            _ => return Err(MmapError::KernelAddress),
        }
        let file = file.reopen().map_err(|_| MmapError::Reopen)?;

        let mut state = self.state.lock();
        let process = process_memory(&mut state.processes, pid);
        let id = process.mmaps.next_id();

        for (i, upage) in pages_spanned(addr, len).enumerate() {
            let source = PageSource::MappedFile {
                mapping: id,
                file: file.clone(),
                offset: (i * PAGE_FRAME_SIZE) as u64,
            };
            if process.spt.try_declare(upage, source, true).is_none() {
                // Roll back: the pages declared so far were never touched.
                for declared in pages_spanned(addr, upage - addr) {
                    process.spt.remove(declared);
                }
                debug!("pid {pid}: mmap at {addr:#x} overlaps {upage:#x}");
                return Err(MmapError::Overlap);
            }
        }

        process.mmaps.insert(Mapping {
            id,
            file,
            base: addr,
            len,
        });
        debug!("pid {pid}: mapping {id} at {addr:#x}, {len} bytes");
        Ok(id)
    }

    /// Removes mapping `id` and every page it covers. An id `pid` does not
    /// hold is a bug in the caller.
    pub fn munmap(&self, pid: Pid, id: MapId) {
        let mut state = self.state.lock();
        let PagingState {
            frames,
            swap,
            processes,
        } = &mut *state;
        let process = process_memory(processes, pid);
        let Some(mapping) = process.mmaps.remove(id) else {
            panic!("pid {pid}: munmap of unknown mapping {id}");
        };
        unmap_pages(process, &mapping, frames, swap);
        debug!("pid {pid}: unmapped mapping {id} at {:#x}", mapping.base);
    }

    /// Number of live mappings of `pid`.
    pub fn mappings(&self, pid: Pid) -> usize {
        let mut state = self.state.lock();
        process_memory(&mut state.processes, pid).mmaps.len()
    }
}
