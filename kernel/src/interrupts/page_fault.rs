//! The page-fault exception (#PF, vector 14).
//!
//! The low-level stub saves the user context, reads `cr2` and the error code
//! the CPU pushed, and calls [`handle_page_fault`]. Faults raised from kernel
//! mode while a system call touches user memory end up here too, which is why
//! the stack pointer comes from the saved user context rather than the
//! interrupt frame.

use crate::mem::Vm;
use crate::threading::process::{UserContext, KILLED_STATUS};
use bitbybit::bitfield;
use log::{trace, warn};

#[bitfield(u32, default = 0)]
pub struct PageFaultErrorCode {
    /// Set for a protection violation, clear for a not-present page.
    #[bit(0, r)]
    present: bool,
    #[bit(1, r)]
    write: bool,
    /// Set if the access came from user mode.
    #[bit(2, r)]
    user: bool,
}

/// Resolves a page fault for the thread described by `ctx`.
///
/// Returns `true` if the faulting access can be retried. Otherwise the
/// process has been killed with [`KILLED_STATUS`].
pub fn handle_page_fault(
    vm: &Vm,
    ctx: &dyn UserContext,
    fault_addr: usize,
    error_code: u32,
) -> bool {
    let code = PageFaultErrorCode::new_with_raw_value(error_code);
    let pid = ctx.pid();
    trace!(
        "pid {pid}: #PF at {fault_addr:#x} ({} {} from {} mode)",
        if code.present() { "rights violation" } else { "not present" },
        if code.write() { "writing" } else { "reading" },
        if code.user() { "user" } else { "kernel" },
    );

    if code.present() {
        warn!("pid {pid}: protection violation at {fault_addr:#x}, killing process");
        ctx.kill(KILLED_STATUS);
        return false;
    }

    match vm.page_fault(pid, fault_addr, ctx.user_stack_pointer()) {
        Ok(()) => true,
        Err(e) => {
            warn!("pid {pid}: page fault at {fault_addr:#x}: {e}, killing process");
            ctx.kill(KILLED_STATUS);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, BlockType};
    use crate::drivers::ram_disk::RamDisk;
    use crate::mem::{PageState, VmConfig};
    use crate::paging::PageManager;
    use crate::threading::process::Pid;
    use alloc::boxed::Box;
    use core::cell::Cell;
    use kidneyos_vm_shared::mem::{OFFSET, PAGE_FRAME_SIZE};

    struct FakeThread {
        pid: Pid,
        esp: usize,
        status: Cell<Option<i32>>,
    }

    impl UserContext for FakeThread {
        fn pid(&self) -> Pid {
            self.pid
        }
        fn user_stack_pointer(&self) -> usize {
            self.esp
        }
        fn kill(&self, status: i32) {
            self.status.set(Some(status));
        }
    }

    fn setup() -> (Vm, FakeThread) {
        crate::logger::init_for_tests();
        let swap = Block::new(BlockType::Swap, "swap", Box::new(RamDisk::new(64)));
        let vm = Vm::new(VmConfig::default().with_user_frames(2), swap);
        vm.register_process(3, Box::new(PageManager::new()));
        let thread = FakeThread {
            pid: 3,
            esp: OFFSET - 0x100,
            status: Cell::new(None),
        };
        (vm, thread)
    }

    const NOT_PRESENT_USER_WRITE: u32 = 0b110;

    #[test]
    fn decodes_error_code() {
        let code = PageFaultErrorCode::new_with_raw_value(0b101);
        assert!(code.present());
        assert!(!code.write());
        assert!(code.user());
    }

    #[test]
    fn stack_fault_is_resolved() {
        let (vm, thread) = setup();
        assert!(handle_page_fault(
            &vm,
            &thread,
            OFFSET - 0x104,
            NOT_PRESENT_USER_WRITE
        ));
        assert_eq!(thread.status.get(), None);
        assert!(matches!(
            vm.page_state(3, OFFSET - PAGE_FRAME_SIZE),
            Some(PageState::Resident { .. })
        ));
    }

    #[test]
    fn wild_access_kills() {
        let (vm, thread) = setup();
        assert!(!handle_page_fault(&vm, &thread, 0x1234, 0b100));
        assert_eq!(thread.status.get(), Some(KILLED_STATUS));
    }

    #[test]
    fn protection_violation_kills() {
        let (vm, thread) = setup();
        vm.declare_zero_page(3, 0x0804_8000, false);
        assert!(!handle_page_fault(&vm, &thread, 0x0804_8000, 0b111));
        assert_eq!(thread.status.get(), Some(KILLED_STATUS));
        assert_eq!(vm.page_state(3, 0x0804_8000), Some(PageState::NotPopulated));
    }
}
