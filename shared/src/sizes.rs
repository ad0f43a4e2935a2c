pub const KB: usize = 1024;
pub const MB: usize = KB * KB;

/// Upper bound on the number of page-sized slots the swap device is carved into.
pub const SWAP_SLOTS: usize = 8192;
