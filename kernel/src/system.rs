use crate::block::Block;
use crate::mem::{Vm, VmConfig};
use alloc::boxed::Box;
use once_cell::race::OnceBox;

static VM: OnceBox<Vm> = OnceBox::new();

/// Brings up the kernel-wide pager on `swap`. Called once during boot; a
/// second call is a bug.
pub fn init_vm(config: VmConfig, swap: Block) -> &'static Vm {
    if VM.set(Box::new(Vm::new(config, swap))).is_err() {
        panic!("VM initialized twice.");
    }
    vm()
}

/// The kernel-wide pager. Panics before [`init_vm`].
pub fn vm() -> &'static Vm {
    match VM.get() {
        Some(vm) => vm,
        None => panic!("VM not initialized."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockType, BLOCK_SECTOR_SIZE};
    use crate::drivers::ram_disk::RamDisk;
    use crate::paging::PageManager;
    use kidneyos_vm_shared::mem::PAGE_FRAME_SIZE;

    fn swap() -> Block {
        let sectors = 4 * (PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE) as u32;
        Block::new(BlockType::Swap, "swap", Box::new(RamDisk::new(sectors)))
    }

    // The global is process-wide, so everything about it lives in one test.
    #[test]
    fn global_vm_is_set_once() {
        crate::logger::init_for_tests();
        let vm = init_vm(VmConfig::default().with_user_frames(2), swap());
        assert!(core::ptr::eq(vm, super::vm()));
        assert_eq!(vm.free_frames(), 2);

        vm.register_process(9, Box::new(PageManager::new()));
        vm.declare_zero_page(9, 0x0800_0000, true);
        vm.page_fault(9, 0x0800_0000, 0).unwrap();
        assert_eq!(super::vm().free_frames(), 1);
        vm.destroy_all_pages(9);

        let again = std::panic::catch_unwind(|| {
            init_vm(VmConfig::default(), swap());
        });
        assert!(again.is_err());
    }
}
