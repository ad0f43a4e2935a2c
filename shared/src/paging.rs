// https://wiki.osdev.org/Paging
// https://wiki.osdev.org/Setting_Up_Paging

// Avoids lots of warnings about casting usize to u32 which cannot result in
// truncation on a 32-bit platform, which is all we support. It would be nice if
// you could tell clippy that you were only dealing with 32-bit usizes...
#![allow(clippy::cast_possible_truncation)]

use crate::mem::{pg_ofs, PAGE_FRAME_SIZE};
use alloc::{boxed::Box, vec::Vec};
use arbitrary_int::{u10, u12, u20};
use bitbybit::bitfield;
use core::{
    mem::size_of,
    ops::{Deref, DerefMut},
};

const PAGE_DIRECTORY_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageDirectoryEntry>();

#[repr(align(4096))]
pub struct PageDirectory(pub [PageDirectoryEntry; PAGE_DIRECTORY_LEN]);

impl PageDirectory {
    pub const DEFAULT: Self = Self([PageDirectoryEntry::DEFAULT; PAGE_DIRECTORY_LEN]);
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Deref for PageDirectory {
    type Target = [PageDirectoryEntry; PAGE_DIRECTORY_LEN];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PageDirectory {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[bitfield(u32, default = 0)]
pub struct PageDirectoryEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(3, rw)]
    write_through: bool,
    #[bit(4, rw)]
    cache_disable: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(7, rw)]
    page_size: bool,
    #[bits(12..=31, rw)]
    page_table_address: u20,
}

const PAGE_TABLE_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageTableEntry>();

#[repr(align(4096))]
pub struct PageTable(pub [PageTableEntry; PAGE_TABLE_LEN]);

impl PageTable {
    pub const DEFAULT: Self = Self([PageTableEntry::DEFAULT; PAGE_TABLE_LEN]);
}

impl Default for PageTable {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Deref for PageTable {
    type Target = [PageTableEntry; PAGE_TABLE_LEN];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PageTable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(3, rw)]
    write_through: bool,
    #[bit(4, rw)]
    cache_disable: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bit(7, rw)]
    page_attribute_table: bool,
    #[bit(8, rw)]
    global: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(22..=31, r)]
    page_directory_index: u10,
    #[bits(12..=21, r)]
    page_table_index: u10,
    #[bits(0..=11, r)]
    offset: u12,
}

impl VirtualAddress {
    pub fn from_usize(addr: usize) -> Self {
        assert!(
            u32::try_from(addr).is_ok(),
            "virtual address {addr:#X} does not fit in 32 bits"
        );
        Self::new_with_raw_value(addr as u32)
    }

    fn indices(self) -> (usize, usize) {
        (
            usize::from(self.page_directory_index().value()),
            usize::from(self.page_table_index().value()),
        )
    }
}

/// A two-level i386 page directory for one user address space.
///
/// Page tables are owned by the manager. The `page_table_address` of a present
/// directory entry is the index of its table in `tables`, not a physical
/// address, since the tables are never walked by the MMU of a hosted build.
pub struct PageManager {
    directory: Box<PageDirectory>,
    tables: Vec<Box<PageTable>>,
    mapped: usize,
}

impl Default for PageManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PageManager {
    pub fn new() -> Self {
        Self {
            directory: Box::new(PageDirectory::DEFAULT),
            tables: Vec::new(),
            mapped: 0,
        }
    }

    fn entry(&self, virt_addr: usize) -> Option<&PageTableEntry> {
        let (pdi, pti) = VirtualAddress::from_usize(virt_addr).indices();
        let pde = self.directory[pdi];
        if !pde.present() {
            return None;
        }
        let table = &self.tables[pde.page_table_address().value() as usize];
        let pte = &table[pti];
        pte.present().then_some(pte)
    }

    fn entry_mut(&mut self, virt_addr: usize) -> Option<&mut PageTableEntry> {
        let (pdi, pti) = VirtualAddress::from_usize(virt_addr).indices();
        let pde = self.directory[pdi];
        if !pde.present() {
            return None;
        }
        let table = &mut self.tables[pde.page_table_address().value() as usize];
        let pte = &mut table[pti];
        pte.present().then_some(pte)
    }

    /// Maps the page containing `virt_addr` to the frame at `phys_addr`.
    ///
    /// Returns `false` without changing anything if the page is already mapped.
    #[must_use]
    pub fn map(&mut self, phys_addr: usize, virt_addr: usize, write: bool, user: bool) -> bool {
        debug_assert_eq!(pg_ofs(phys_addr), 0);
        assert!(
            u32::try_from(phys_addr).is_ok(),
            "physical address {phys_addr:#X} does not fit in 32 bits"
        );

        let (pdi, pti) = VirtualAddress::from_usize(virt_addr).indices();
        if !self.directory[pdi].present() {
            let index = self.tables.len();
            self.tables.push(Box::new(PageTable::DEFAULT));
            self.directory[pdi] = PageDirectoryEntry::DEFAULT
                .with_present(true)
                .with_read_write(true)
                .with_user_supervisor(true)
                .with_page_table_address(u20::new(index as u32));
        }

        let table_index = self.directory[pdi].page_table_address().value() as usize;
        let pte = &mut self.tables[table_index][pti];
        if pte.present() {
            return false;
        }

        *pte = PageTableEntry::DEFAULT
            .with_present(true)
            .with_read_write(write)
            .with_user_supervisor(user)
            .with_page_frame_address(u20::new((phys_addr >> 12) as u32));
        self.mapped += 1;
        true
    }

    /// Removes the translation for the page containing `virt_addr`, if any.
    pub fn unmap(&mut self, virt_addr: usize) {
        if let Some(pte) = self.entry_mut(virt_addr) {
            *pte = PageTableEntry::DEFAULT;
            self.mapped -= 1;
        }
    }

    /// Returns the physical address `virt_addr` translates to.
    pub fn translate(&self, virt_addr: usize) -> Option<usize> {
        let pte = self.entry(virt_addr)?;
        Some(((pte.page_frame_address().value() as usize) << 12) | pg_ofs(virt_addr))
    }

    pub fn is_writable(&self, virt_addr: usize) -> bool {
        self.entry(virt_addr).is_some_and(|pte| pte.read_write())
    }

    pub fn mapped_pages(&self) -> usize {
        self.mapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_translate_unmap() {
        let mut pm = PageManager::new();
        assert!(pm.map(0x0010_0000, 0x0804_8000, true, true));
        assert_eq!(pm.translate(0x0804_8123), Some(0x0010_0123));
        assert!(pm.is_writable(0x0804_8000));
        assert_eq!(pm.mapped_pages(), 1);

        pm.unmap(0x0804_8fff);
        assert_eq!(pm.translate(0x0804_8000), None);
        assert_eq!(pm.mapped_pages(), 0);
    }

    #[test]
    fn double_map_is_refused() {
        let mut pm = PageManager::new();
        assert!(pm.map(0x1000, 0x4000_0000, false, true));
        assert!(!pm.map(0x2000, 0x4000_0000, true, true));
        assert_eq!(pm.translate(0x4000_0000), Some(0x1000));
        assert!(!pm.is_writable(0x4000_0000));
    }

    #[test]
    fn tables_are_shared_within_a_directory_slot() {
        let mut pm = PageManager::new();
        assert!(pm.map(0x1000, 0xBFFF_F000, true, true));
        assert!(pm.map(0x2000, 0xBFFF_E000, true, true));
        assert_eq!(pm.tables.len(), 1);
    }
}
