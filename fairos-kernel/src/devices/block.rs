//! Sector-addressed block device interface.
//!
//! The swap store is the only user. Transfers are synchronous: a call blocks
//! the calling thread until the sector has been read or written.

use fairos_abi::SECTOR_SIZE;

/// Errors that can occur during block operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// Sector number past the end of the device.
    InvalidSector,
    /// Buffer is not exactly one sector long.
    BadLength,
    /// Write operation not supported (read-only device).
    NotWritable,
    /// I/O error during operation.
    IoError,
}

/// Synchronous sector interface.
pub trait BlockDevice: Send + Sync {
    /// Number of `SECTOR_SIZE`-byte sectors on the device.
    fn sector_count(&self) -> u64;

    /// Read one sector into `buf`, which must be `SECTOR_SIZE` bytes.
    fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<(), BlockError>;

    /// Write one sector from `buf`, which must be `SECTOR_SIZE` bytes.
    fn write_sector(&self, _sector: u64, _buf: &[u8]) -> Result<(), BlockError> {
        Err(BlockError::NotWritable)
    }
}

/// Check a transfer against the device geometry.
pub fn check_transfer<D: BlockDevice + ?Sized>(
    device: &D,
    sector: u64,
    len: usize,
) -> Result<(), BlockError> {
    if len != SECTOR_SIZE {
        return Err(BlockError::BadLength);
    }
    if sector >= device.sector_count() {
        return Err(BlockError::InvalidSector);
    }
    Ok(())
}
