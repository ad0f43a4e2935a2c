//! Swap space: the swap block device carved into page-sized slots.

use crate::block::{Block, BlockSector, BLOCK_SECTOR_SIZE};
use alloc::{vec, vec::Vec};
use kidneyos_vm_shared::mem::PAGE_FRAME_SIZE;
use log::trace;

const SECTORS_IN_PAGE: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;

/// Index of a page-sized slot on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SwapSlot(pub usize);

pub struct SwapSpace {
    device: Block,
    in_use: Vec<bool>,
    free: usize,
}

impl SwapSpace {
    /// Use `device` for swap, with at most `max_slots` slots.
    pub fn new(device: Block, max_slots: usize) -> Self {
        let slots = (device.get_size() as usize / SECTORS_IN_PAGE).min(max_slots);
        Self {
            device,
            in_use: vec![false; slots],
            free: slots,
        }
    }

    pub fn slots(&self) -> usize {
        self.in_use.len()
    }

    pub fn free_slots(&self) -> usize {
        self.free
    }

    pub fn is_in_use(&self, slot: SwapSlot) -> bool {
        self.in_use.get(slot.0).copied().unwrap_or(false)
    }

    /// Reserve a free slot, first fit.
    ///
    /// Running out of swap is fatal: the evicted page has nowhere else to go.
    pub fn allocate_slot(&mut self) -> SwapSlot {
        let Some(index) = self.in_use.iter().position(|used| !used) else {
            panic!("out of swap slots ({} in use)", self.in_use.len());
        };
        self.in_use[index] = true;
        self.free -= 1;
        SwapSlot(index)
    }

    pub fn free_slot(&mut self, slot: SwapSlot) {
        assert!(self.is_in_use(slot), "freeing unused swap slot {}", slot.0);
        self.in_use[slot.0] = false;
        self.free += 1;
    }

    #[allow(clippy::cast_possible_truncation)]
    fn first_sector(slot: SwapSlot) -> BlockSector {
        (slot.0 * SECTORS_IN_PAGE) as BlockSector
    }

    /// Write a whole page into `slot`, one sector at a time.
    pub fn write_page(&mut self, slot: SwapSlot, page: &[u8]) {
        assert!(self.is_in_use(slot), "writing unallocated swap slot {}", slot.0);
        assert_eq!(page.len(), PAGE_FRAME_SIZE);
        trace!("swap out to slot {}", slot.0);

        let first = Self::first_sector(slot);
        for (i, sector) in page.chunks_exact(BLOCK_SECTOR_SIZE).enumerate() {
            let sector_no = first + i as BlockSector;
            if let Err(e) = self.device.write(sector_no, sector) {
                panic!("swap write to sector {sector_no} failed: {e}");
            }
        }
    }

    /// Read the whole page stored in `slot` into `page`.
    pub fn read_page(&mut self, slot: SwapSlot, page: &mut [u8]) {
        assert!(self.is_in_use(slot), "reading unallocated swap slot {}", slot.0);
        assert_eq!(page.len(), PAGE_FRAME_SIZE);
        trace!("swap in from slot {}", slot.0);

        let first = Self::first_sector(slot);
        for (i, sector) in page.chunks_exact_mut(BLOCK_SECTOR_SIZE).enumerate() {
            let sector_no = first + i as BlockSector;
            if let Err(e) = self.device.read(sector_no, sector) {
                panic!("swap read from sector {sector_no} failed: {e}");
            }
        }
    }

    pub fn device(&self) -> &Block {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockType;
    use crate::drivers::dummy_device::DummyDevice;
    use crate::drivers::ram_disk::RamDisk;
    use alloc::boxed::Box;

    fn swap(pages: u32, max_slots: usize) -> SwapSpace {
        let disk = RamDisk::new(pages * SECTORS_IN_PAGE as u32);
        SwapSpace::new(Block::new(BlockType::Swap, "swap", Box::new(disk)), max_slots)
    }

    #[test]
    fn slot_count_is_capped() {
        assert_eq!(swap(4, 100).slots(), 4);
        assert_eq!(swap(4, 2).slots(), 2);
    }

    #[test]
    fn page_survives_a_round_trip() {
        let mut swap = swap(3, 8);
        let mut page = vec![0u8; PAGE_FRAME_SIZE];
        for (i, byte) in page.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }

        let _ = swap.allocate_slot();
        let slot = swap.allocate_slot();
        assert_eq!(slot, SwapSlot(1));
        swap.write_page(slot, &page);

        let mut back = vec![0u8; PAGE_FRAME_SIZE];
        swap.read_page(slot, &mut back);
        assert_eq!(page, back);
        assert_eq!(swap.device().write_count(), SECTORS_IN_PAGE as u32);
        assert_eq!(swap.device().read_count(), SECTORS_IN_PAGE as u32);
    }

    #[test]
    fn first_fit_reuses_freed_slots() {
        let mut swap = swap(3, 8);
        let a = swap.allocate_slot();
        let b = swap.allocate_slot();
        swap.free_slot(a);
        assert_eq!(swap.free_slots(), 2);
        assert_eq!(swap.allocate_slot(), a);
        assert!(swap.is_in_use(b));
    }

    #[test]
    #[should_panic(expected = "out of swap slots")]
    fn exhaustion_is_fatal() {
        let mut swap = swap(1, 8);
        swap.allocate_slot();
        swap.allocate_slot();
    }

    #[test]
    #[should_panic(expected = "out of swap slots")]
    fn no_swap_device() {
        let mut swap = SwapSpace::new(
            Block::new(BlockType::Swap, "none", Box::new(DummyDevice::new())),
            8,
        );
        swap.allocate_slot();
    }

    #[test]
    #[should_panic(expected = "freeing unused swap slot")]
    fn double_free_is_a_bug() {
        let mut swap = swap(1, 8);
        let slot = swap.allocate_slot();
        swap.free_slot(slot);
        swap.free_slot(slot);
    }
}
