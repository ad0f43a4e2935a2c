#![cfg_attr(target_os = "none", no_std)]

//! Demand-paged virtual memory for user processes: lazy loading, swapping,
//! stack growth and memory-mapped files on top of a per-process
//! supplemental page table.

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod fs;
pub mod interrupts;
pub mod logger;
pub mod mem;
pub mod paging;
pub mod swapping;
pub mod sync;
pub mod system;
pub mod threading;
pub mod user_program;
