//! RAM-backed block device
//!
//! Holds a whole disk image in memory. Used for boot-time images handed over
//! by the loader and as the backing store in filesystem tests.

use crate::{check_transfer, BlockDevice, BlockError, DEFAULT_SECTOR_SIZE};
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::RwLock;

/// In-memory block device.
pub struct RamDisk {
    name: String,
    sector_size: u32,
    data: RwLock<Vec<u8>>,
    read_only: AtomicBool,
}

impl RamDisk {
    /// Wrap an existing image. The image is padded with zeroes up to a whole
    /// number of sectors.
    pub fn new(name: &str, mut image: Vec<u8>) -> Self {
        let sector = DEFAULT_SECTOR_SIZE as usize;
        let rem = image.len() % sector;
        if rem != 0 {
            image.resize(image.len() + sector - rem, 0);
        }
        Self {
            name: name.into(),
            sector_size: DEFAULT_SECTOR_SIZE,
            data: RwLock::new(image),
            read_only: AtomicBool::new(false),
        }
    }

    /// Create a zero-filled disk of `bytes` bytes (rounded up to a sector).
    pub fn zeroed(name: &str, bytes: usize) -> Self {
        Self::new(name, alloc::vec![0u8; bytes])
    }

    /// Copy of the current image contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Toggle write protection.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    /// Image size in bytes.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockDevice for RamDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn capacity_sectors(&self) -> u64 {
        (self.data.read().len() / self.sector_size as usize) as u64
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    fn read_sync(&self, sector: u64, buf: &mut [u8]) -> Result<usize, BlockError> {
        let data = self.data.read();
        let capacity = (data.len() / self.sector_size as usize) as u64;
        check_transfer(sector, buf.len(), self.sector_size, capacity)?;

        let start = sector as usize * self.sector_size as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(buf.len())
    }

    fn write_sync(&self, sector: u64, buf: &[u8]) -> Result<usize, BlockError> {
        if self.is_read_only() {
            return Err(BlockError::ReadOnly);
        }
        let mut data = self.data.write();
        let capacity = (data.len() / self.sector_size as usize) as u64;
        check_transfer(sector, buf.len(), self.sector_size, capacity)?;

        let start = sector as usize * self.sector_size as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&self) -> Result<(), BlockError> {
        Ok(())
    }
}
