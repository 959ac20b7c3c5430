//! Block adapter
//!
//! Filesystems address their volume in fixed-size logical blocks. The adapter
//! maps block `n` to the sector range `[base + n * spb, base + (n + 1) * spb)`
//! on the underlying device, where `spb` is sectors per block and `base` is
//! the partition start.

use crate::{BlockDevice, BlockError};
use alloc::sync::Arc;
use alloc::vec;

/// Whole-block I/O on top of a sector-addressed [`BlockDevice`].
#[derive(Clone)]
pub struct BlockAdapter {
    dev: Arc<dyn BlockDevice>,
    block_size: u32,
    sectors_per_block: u64,
    base_sector: u64,
}

impl BlockAdapter {
    /// Create an adapter.
    ///
    /// `block_size` must be a non-zero multiple of the device sector size and
    /// `base_offset` (the partition start in bytes) must be sector aligned.
    pub fn new(
        dev: Arc<dyn BlockDevice>,
        block_size: u32,
        base_offset: u64,
    ) -> Result<Self, BlockError> {
        let sector_size = dev.sector_size();
        if sector_size == 0 || base_offset % sector_size as u64 != 0 {
            return Err(BlockError::Invalid);
        }
        let mut adapter = Self {
            dev,
            block_size: 0,
            sectors_per_block: 0,
            base_sector: base_offset / sector_size as u64,
        };
        adapter.set_block_size(block_size)?;
        Ok(adapter)
    }

    /// Change the logical block size (after the superblock has been probed).
    pub fn set_block_size(&mut self, block_size: u32) -> Result<(), BlockError> {
        let sector_size = self.dev.sector_size();
        if block_size == 0 || block_size % sector_size != 0 {
            return Err(BlockError::Invalid);
        }
        self.block_size = block_size;
        self.sectors_per_block = (block_size / sector_size) as u64;
        Ok(())
    }

    /// Logical block size in bytes.
    #[inline]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Underlying device.
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    /// Whether writes would be rejected by the device.
    pub fn is_read_only(&self) -> bool {
        self.dev.is_read_only()
    }

    /// Number of whole logical blocks that fit on the device after `base`.
    pub fn block_count(&self) -> u64 {
        self.dev.capacity_sectors().saturating_sub(self.base_sector) / self.sectors_per_block
    }

    fn block_to_sector(&self, block: u64) -> Result<u64, BlockError> {
        block
            .checked_mul(self.sectors_per_block)
            .and_then(|s| s.checked_add(self.base_sector))
            .ok_or(BlockError::OutOfRange)
    }

    /// Read logical block `block` into `buf` (exactly one block long).
    pub fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        if buf.len() != self.block_size as usize {
            return Err(BlockError::Invalid);
        }
        let sector = self.block_to_sector(block)?;
        self.dev.read_sync(sector, buf).map(|_| ())
    }

    /// Write logical block `block` from `buf` (exactly one block long).
    pub fn write_block(&self, block: u64, buf: &[u8]) -> Result<(), BlockError> {
        if buf.len() != self.block_size as usize {
            return Err(BlockError::Invalid);
        }
        if self.dev.is_read_only() {
            return Err(BlockError::ReadOnly);
        }
        let sector = self.block_to_sector(block)?;
        self.dev.write_sync(sector, buf).map(|_| ())
    }

    /// Read an arbitrary byte range relative to the partition start.
    ///
    /// Used before the block size is known (superblock probe). Goes through a
    /// sector-aligned bounce buffer.
    pub fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        if buf.is_empty() {
            return Ok(());
        }
        let sector_size = self.dev.sector_size() as u64;
        let first = offset / sector_size;
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(BlockError::OutOfRange)?;
        let last = (end + sector_size - 1) / sector_size;
        let mut bounce = vec![0u8; ((last - first) * sector_size) as usize];
        self.dev.read_sync(self.base_sector + first, &mut bounce)?;

        let skip = (offset - first * sector_size) as usize;
        buf.copy_from_slice(&bounce[skip..skip + buf.len()]);
        Ok(())
    }

    /// Flush the device write cache. Devices without a cache report success.
    pub fn flush(&self) -> Result<(), BlockError> {
        match self.dev.flush() {
            Err(BlockError::NotSupported) => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RamDisk;

    fn disk_with_pattern(bytes: usize) -> Arc<RamDisk> {
        let image: alloc::vec::Vec<u8> = (0..bytes).map(|i| (i / 512) as u8).collect();
        Arc::new(RamDisk::new("adapt0", image))
    }

    #[test]
    fn test_block_maps_to_sectors() {
        let disk = disk_with_pattern(8192);
        let adapter = BlockAdapter::new(disk, 1024, 0).unwrap();
        let mut buf = vec![0u8; 1024];
        adapter.read_block(3, &mut buf).unwrap();
        assert_eq!(buf[0], 6);
        assert_eq!(buf[1023], 7);
        assert_eq!(adapter.block_count(), 8);
    }

    #[test]
    fn test_partition_offset() {
        let disk = disk_with_pattern(8192);
        let adapter = BlockAdapter::new(disk.clone(), 1024, 2048).unwrap();
        let mut buf = vec![0u8; 1024];
        adapter.read_block(0, &mut buf).unwrap();
        assert_eq!(buf[0], 4);

        adapter.write_block(1, &[0xEEu8; 1024]).unwrap();
        let image = disk.snapshot();
        assert!(image[3072..4096].iter().all(|&b| b == 0xEE));
        assert_eq!(image[2048], 4);
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let disk = disk_with_pattern(4096);
        assert!(BlockAdapter::new(disk.clone(), 1000, 0).is_err());
        assert!(BlockAdapter::new(disk.clone(), 1024, 100).is_err());

        let adapter = BlockAdapter::new(disk, 1024, 0).unwrap();
        let mut short = vec![0u8; 512];
        assert_eq!(adapter.read_block(0, &mut short), Err(BlockError::Invalid));
    }

    #[test]
    fn test_unaligned_byte_read() {
        let disk = disk_with_pattern(4096);
        let adapter = BlockAdapter::new(disk, 1024, 0).unwrap();
        let mut buf = [0u8; 8];
        adapter.read_bytes(1020, &mut buf).unwrap();
        assert_eq!(buf, [1, 1, 1, 1, 2, 2, 2, 2]);
    }
}
