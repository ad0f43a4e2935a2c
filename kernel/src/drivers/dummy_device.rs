use crate::block::{BlockError, BlockOp, BlockSector};

/// A block device with no sectors, for kernels booted without a swap disk.
///
/// Any access panics, since the block layer bounds-checks before reaching it.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct DummyDevice;

impl DummyDevice {
    pub const fn new() -> Self {
        Self
    }
}

impl BlockOp for DummyDevice {
    fn read(&mut self, sector: BlockSector, _buf: &mut [u8]) -> Result<(), BlockError> {
        panic!("Reading dummy device at sector {}", sector);
    }
    fn write(&mut self, sector: BlockSector, _buf: &[u8]) -> Result<(), BlockError> {
        panic!("Writing dummy device at sector {}", sector);
    }
    fn sectors(&self) -> BlockSector {
        0
    }
}
