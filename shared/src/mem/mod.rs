use crate::sizes::{KB, MB};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address. User stacks
// start right below it and grow down.
pub const OFFSET: usize = 0xC000_0000;

/// Largest region below [`OFFSET`] the user stack may grow into.
pub const MAX_STACK_SIZE: usize = 8 * MB;

/// How far below the stack pointer an access may land and still count as
/// stack growth. `pusha` touches 32 bytes below `esp` before moving it.
pub const STACK_SLACK: usize = 32;

/// Number of frames handed to user processes unless configured otherwise.
pub const USER_FRAMES: usize = 256;

/// Physical address of the first frame of the user pool.
pub const USER_POOL_BASE: usize = 0x0100_0000;

#[inline]
pub const fn pg_ofs(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn pg_round_up(addr: usize) -> usize {
    pg_round_down(addr + PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < OFFSET
}
