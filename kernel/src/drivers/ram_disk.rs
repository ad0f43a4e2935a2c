use crate::block::{BlockError, BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use alloc::{vec, vec::Vec};

/// A block device backed by kernel memory.
///
/// Used as the swap device when no disk is attached, and by the tests.
pub struct RamDisk {
    data: Vec<u8>,
}

impl RamDisk {
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            data: vec![0; sectors as usize * BLOCK_SECTOR_SIZE],
        }
    }

    fn range(&self, sector: BlockSector) -> Result<core::ops::Range<usize>, BlockError> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        let end = start + BLOCK_SECTOR_SIZE;
        if end > self.data.len() {
            return Err(BlockError::SectorOutOfBounds);
        }
        Ok(start..end)
    }
}

impl BlockOp for RamDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let range = self.range(sector)?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        let range = self.range(sector)?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn sectors(&self) -> BlockSector {
        (self.data.len() / BLOCK_SECTOR_SIZE) as BlockSector
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sectors_are_independent() {
        let mut disk = RamDisk::new(2);
        assert_eq!(disk.sectors(), 2);
        disk.write(1, &[7u8; BLOCK_SECTOR_SIZE]).unwrap();
        let mut buf = [1u8; BLOCK_SECTOR_SIZE];
        disk.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        disk.read(1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
        assert_eq!(disk.read(2, &mut buf), Err(BlockError::SectorOutOfBounds));
    }
}
