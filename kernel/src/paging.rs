use kidneyos_vm_shared::mem::pg_round_down;

pub use kidneyos_vm_shared::paging::PageManager;

/// The hardware translation for one user address space.
///
/// The pager only ever installs, queries and removes single user pages; it
/// never walks or allocates page tables itself.
pub trait AddressSpace: Send {
    /// Map the page at `upage` to the frame at `paddr`.
    ///
    /// Returns `false` if the page is already mapped or the tables could not
    /// be extended.
    fn set_page(&mut self, upage: usize, paddr: usize, writable: bool) -> bool;
    /// Physical address `vaddr` translates to, if it is mapped.
    fn get_page(&self, vaddr: usize) -> Option<usize>;
    /// Whether the mapping for `vaddr` allows user writes.
    fn is_writable(&self, vaddr: usize) -> bool;
    /// Remove the translation for the page containing `vaddr`.
    fn clear_page(&mut self, vaddr: usize);
}

impl AddressSpace for PageManager {
    fn set_page(&mut self, upage: usize, paddr: usize, writable: bool) -> bool {
        debug_assert_eq!(pg_round_down(upage), upage);
        self.map(paddr, upage, writable, true)
    }

    fn get_page(&self, vaddr: usize) -> Option<usize> {
        self.translate(vaddr)
    }

    fn is_writable(&self, vaddr: usize) -> bool {
        PageManager::is_writable(self, vaddr)
    }

    fn clear_page(&mut self, vaddr: usize) {
        self.unmap(vaddr);
    }
}
