//! The supplemental page table: where each user page of a process comes from
//! and where its contents are right now.

use super::frame_allocator::FrameId;
use super::mmap::MapId;
use crate::fs::File;
use crate::swapping::SwapSlot;
use alloc::collections::{btree_map::Entry, BTreeMap};
use alloc::{sync::Arc, vec::Vec};
use core::fmt;
use kidneyos_vm_shared::mem::{pg_ofs, pg_round_down, PAGE_FRAME_SIZE};

/// What a page holds the first time it is touched.
#[derive(Clone)]
pub enum PageSource {
    /// A page of zeros: stack, bss.
    Zero,
    /// `read_bytes` bytes of an executable at `offset`, zeros after that.
    ExecImage {
        file: Arc<dyn File>,
        offset: u64,
        read_bytes: usize,
    },
    /// One page of a memory-mapped file, zero padded past end of file.
    MappedFile {
        mapping: MapId,
        file: Arc<dyn File>,
        offset: u64,
    },
}

impl fmt::Debug for PageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zero => write!(f, "Zero"),
            Self::ExecImage {
                offset, read_bytes, ..
            } => write!(f, "ExecImage {{ offset: {offset:#x}, read_bytes: {read_bytes} }}"),
            Self::MappedFile {
                mapping, offset, ..
            } => write!(f, "MappedFile {{ mapping: {}, offset: {offset:#x} }}", mapping.0),
        }
    }
}

/// Where the contents of a page currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Never faulted in; the contents are still only in the source.
    NotPopulated,
    Resident(FrameId),
    Swapped(SwapSlot),
}

#[derive(Debug, Clone)]
pub struct SptEntry {
    upage: usize,
    source: PageSource,
    writable: bool,
    pub(super) residency: Residency,
}

impl SptEntry {
    pub fn upage(&self) -> usize {
        self.upage
    }
    pub fn source(&self) -> &PageSource {
        &self.source
    }
    pub fn writable(&self) -> bool {
        self.writable
    }
    pub fn residency(&self) -> Residency {
        self.residency
    }
    pub fn populated(&self) -> bool {
        self.residency != Residency::NotPopulated
    }
    pub fn frame(&self) -> Option<FrameId> {
        match self.residency {
            Residency::Resident(frame) => Some(frame),
            _ => None,
        }
    }
    pub fn swap_slot(&self) -> Option<SwapSlot> {
        match self.residency {
            Residency::Swapped(slot) => Some(slot),
            _ => None,
        }
    }
}

/// The pages of one process, keyed by page address.
#[derive(Debug, Default)]
pub struct SupplementalPageTable(BTreeMap<usize, SptEntry>);

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry for the page at `upage`, or returns `None` if the page is
    /// already covered.
    pub fn try_declare(
        &mut self,
        upage: usize,
        source: PageSource,
        writable: bool,
    ) -> Option<&mut SptEntry> {
        assert_eq!(pg_ofs(upage), 0, "declaring unaligned page {upage:#x}");
        if let PageSource::ExecImage { read_bytes, .. } = &source {
            assert!(*read_bytes <= PAGE_FRAME_SIZE);
        }
        match self.0.entry(upage) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => Some(slot.insert(SptEntry {
                upage,
                source,
                writable,
                residency: Residency::NotPopulated,
            })),
        }
    }

    /// Adds an entry for the page at `upage`. Declaring a page twice is a bug
    /// in the caller.
    pub fn declare(&mut self, upage: usize, source: PageSource, writable: bool) -> &mut SptEntry {
        match self.try_declare(upage, source, writable) {
            Some(entry) => entry,
            None => panic!("page {upage:#x} declared twice"),
        }
    }

    /// The entry covering `vaddr`. If there is none, `declare` may supply the
    /// source and writability of a new one.
    pub fn lookup_or_declare(
        &mut self,
        vaddr: usize,
        declare: impl FnOnce() -> Option<(PageSource, bool)>,
    ) -> Option<&mut SptEntry> {
        let upage = pg_round_down(vaddr);
        match self.0.entry(upage) {
            Entry::Occupied(entry) => Some(entry.into_mut()),
            Entry::Vacant(slot) => {
                let (source, writable) = declare()?;
                Some(slot.insert(SptEntry {
                    upage,
                    source,
                    writable,
                    residency: Residency::NotPopulated,
                }))
            }
        }
    }

    /// The entry covering `vaddr`.
    pub fn lookup(&self, vaddr: usize) -> Option<&SptEntry> {
        self.0.get(&pg_round_down(vaddr))
    }

    pub fn lookup_mut(&mut self, vaddr: usize) -> Option<&mut SptEntry> {
        self.0.get_mut(&pg_round_down(vaddr))
    }

    /// Detaches the entry covering `vaddr`. The caller is responsible for its
    /// frame, swap slot and hardware mapping.
    pub fn remove(&mut self, vaddr: usize) -> Option<SptEntry> {
        self.0.remove(&pg_round_down(vaddr))
    }

    /// Detaches every entry, in address order.
    pub fn take_all(&mut self) -> Vec<SptEntry> {
        core::mem::take(&mut self.0).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_matches_whole_page() {
        let mut spt = SupplementalPageTable::new();
        spt.declare(0x0804_8000, PageSource::Zero, true);
        assert_eq!(spt.lookup(0x0804_8000).map(SptEntry::upage), Some(0x0804_8000));
        assert_eq!(spt.lookup(0x0804_8fff).map(SptEntry::upage), Some(0x0804_8000));
        assert!(spt.lookup(0x0804_9000).is_none());
        assert!(spt.lookup(0x0804_7fff).is_none());
    }

    #[test]
    fn new_entries_are_not_populated() {
        let mut spt = SupplementalPageTable::new();
        let entry = spt.declare(0x1000, PageSource::Zero, false);
        assert!(!entry.populated());
        assert!(!entry.writable());
        assert_eq!(entry.frame(), None);
        assert_eq!(entry.swap_slot(), None);
    }

    #[test]
    fn try_declare_refuses_duplicates() {
        let mut spt = SupplementalPageTable::new();
        assert!(spt.try_declare(0x2000, PageSource::Zero, true).is_some());
        assert!(spt.try_declare(0x2000, PageSource::Zero, false).is_none());
        assert!(spt.lookup(0x2000).unwrap().writable());
        assert_eq!(spt.len(), 1);
    }

    #[test]
    #[should_panic(expected = "declared twice")]
    fn declare_twice_panics() {
        let mut spt = SupplementalPageTable::new();
        spt.declare(0x3000, PageSource::Zero, true);
        spt.declare(0x3000, PageSource::Zero, true);
    }

    #[test]
    fn lookup_or_declare_only_declares_when_missing() {
        let mut spt = SupplementalPageTable::new();
        assert!(spt.lookup_or_declare(0x6010, || None).is_none());
        assert!(spt.is_empty());

        let entry = spt.lookup_or_declare(0x6010, || Some((PageSource::Zero, true)));
        assert_eq!(entry.map(|e| e.upage()), Some(0x6000));
        let entry = spt.lookup_or_declare(0x6ff0, || panic!("already declared"));
        assert!(entry.is_some());
        assert_eq!(spt.len(), 1);
    }

    #[test]
    fn remove_and_take_all() {
        let mut spt = SupplementalPageTable::new();
        for page in [0x5000, 0x3000, 0x4000] {
            spt.declare(page, PageSource::Zero, true);
        }
        assert_eq!(spt.remove(0x4abc).map(|e| e.upage()), Some(0x4000));
        assert!(spt.remove(0x4000).is_none());

        let pages: Vec<usize> = spt.take_all().iter().map(SptEntry::upage).collect();
        assert_eq!(pages, [0x3000, 0x5000]);
        assert!(spt.is_empty());
    }

    #[test]
    fn exec_source_debug_omits_file() {
        let file: Arc<dyn File> = crate::fs::MemFile::new(&b"abc"[..]);
        let source = PageSource::ExecImage {
            file,
            offset: 0x1000,
            read_bytes: 3,
        };
        assert_eq!(
            alloc::format!("{source:?}"),
            "ExecImage { offset: 0x1000, read_bytes: 3 }"
        );
    }
}
