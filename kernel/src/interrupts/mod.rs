//! Interrupt-side entry points into the pager.

pub mod page_fault;
