use core::error::Error;
use core::fmt::{Display, Formatter};

/// Error type for block operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// The sector is past the end of the device
    SectorOutOfBounds,
    /// The buffer is not exactly one sector long
    BufferInvalid,
    ReadError,
    WriteError,
    /// The device refuses writes
    ReadOnly,
}

impl Display for BlockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let message = match self {
            BlockError::SectorOutOfBounds => "sector out of bounds",
            BlockError::BufferInvalid => "buffer is not one sector long",
            BlockError::ReadError => "error reading from the block device",
            BlockError::WriteError => "error writing to the block device",
            BlockError::ReadOnly => "block device is read-only",
        };
        f.write_str(message)
    }
}

impl Error for BlockError {}
