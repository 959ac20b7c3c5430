//! Inode table and allocation bitmaps
//!
//! Allocation is first-fit: groups are scanned in ascending order, the first
//! group whose descriptor reports free entries has its bitmap searched for
//! the lowest clear bit. The bitmap, descriptor and superblock counters are
//! persisted before the number is handed out.

use super::layout::RawInode;
use super::Ext2Fs;
use crate::types::FsError;
use alloc::vec;
use log::{debug, warn};

/// Lowest clear bit below `limit`, skipping bits under `start`.
fn first_clear_bit(bitmap: &[u8], start: u32, limit: u32) -> Option<u32> {
    (start..limit).find(|&bit| bitmap[(bit / 8) as usize] & (1 << (bit % 8)) == 0)
}

#[inline]
fn set_bit(bitmap: &mut [u8], bit: u32) {
    bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
}

impl Ext2Fs {
    /// Block and byte offset of inode `ino` in its group's inode table.
    fn inode_location(&self, ino: u32) -> Result<(u32, usize), FsError> {
        if ino == 0 || ino > self.sb.inodes_count {
            return Err(FsError::Corrupt);
        }
        let ipg = self.sb.inodes_per_group;
        let group = (ino - 1) / ipg;
        let index = (ino - 1) % ipg;
        let table = self
            .alloc
            .lock()
            .groups
            .get(group as usize)
            .map(|d| d.inode_table)
            .ok_or(FsError::Corrupt)?;

        let byte = index as u64 * self.inode_size as u64;
        let block = table as u64 + byte / self.block_size as u64;
        let offset = (byte % self.block_size as u64) as usize;
        Ok((block as u32, offset))
    }

    pub(crate) fn read_inode(&self, ino: u32) -> Result<RawInode, FsError> {
        let (block, offset) = self.inode_location(ino)?;
        let buf = self.read_block(block)?;
        Ok(RawInode::parse(&buf[offset..offset + 128]))
    }

    /// Read-modify-write of the inode's first 128 bytes.
    pub(crate) fn write_inode(&self, ino: u32, raw: &RawInode) -> Result<(), FsError> {
        let (block, offset) = self.inode_location(ino)?;
        let mut buf = self.read_block(block)?;
        raw.encode_into(&mut buf[offset..offset + 128]);
        self.write_block(block, &buf)
    }

    /// Write a freshly allocated inode, clearing the whole on-disk slot.
    pub(crate) fn init_inode(&self, ino: u32, raw: &RawInode) -> Result<(), FsError> {
        let (block, offset) = self.inode_location(ino)?;
        let mut buf = self.read_block(block)?;
        let slot = &mut buf[offset..offset + self.inode_size as usize];
        slot.fill(0);
        raw.encode_into(slot);
        self.write_block(block, &buf)
    }

    fn blocks_in_group(&self, group: u32) -> u32 {
        let start = group * self.sb.blocks_per_group;
        let data_blocks = self.sb.blocks_count - self.sb.first_data_block;
        (data_blocks - start).min(self.sb.blocks_per_group)
    }

    /// Allocate a data block.
    pub(crate) fn allocate_block(&self) -> Result<u32, FsError> {
        self.ensure_writable()?;
        let mut alloc = self.alloc.lock();

        for group in 0..self.groups_count {
            let desc = alloc.groups[group as usize];
            if desc.free_blocks_count == 0 {
                continue;
            }

            let mut bitmap = self.read_block(desc.block_bitmap)?;
            let Some(bit) = first_clear_bit(&bitmap, 0, self.blocks_in_group(group)) else {
                warn!(
                    "ext2: group {} reports {} free blocks but its bitmap is full",
                    group, desc.free_blocks_count
                );
                continue;
            };

            set_bit(&mut bitmap, bit);
            self.write_block(desc.block_bitmap, &bitmap)?;

            let desc = &mut alloc.groups[group as usize];
            desc.free_blocks_count -= 1;
            let desc = *desc;
            alloc.free_blocks = alloc.free_blocks.saturating_sub(1);
            self.persist_group(group, &desc)?;
            self.persist_counters(&alloc)?;

            let block = self.sb.first_data_block + group * self.sb.blocks_per_group + bit;
            debug!("ext2: allocated block {} in group {}", block, group);
            return Ok(block);
        }

        Err(FsError::NoSpace)
    }

    /// Allocate a block and clear it on disk.
    pub(crate) fn allocate_zeroed_block(&self) -> Result<u32, FsError> {
        let block = self.allocate_block()?;
        self.write_block(block, &vec![0u8; self.block_size as usize])?;
        Ok(block)
    }

    /// Allocate an inode number. Reserved inodes below `first_ino` are
    /// never handed out.
    pub(crate) fn allocate_inode(&self, is_dir: bool) -> Result<u32, FsError> {
        self.ensure_writable()?;
        let mut alloc = self.alloc.lock();
        let ipg = self.sb.inodes_per_group;

        for group in 0..self.groups_count {
            let desc = alloc.groups[group as usize];
            if desc.free_inodes_count == 0 {
                continue;
            }

            // first usable bit in this group
            let base = group * ipg;
            let start = (self.first_ino - 1).saturating_sub(base).min(ipg);
            let limit = ipg.min(self.sb.inodes_count.saturating_sub(base));

            let mut bitmap = self.read_block(desc.inode_bitmap)?;
            let Some(bit) = first_clear_bit(&bitmap, start, limit) else {
                warn!(
                    "ext2: group {} reports {} free inodes but its bitmap is full",
                    group, desc.free_inodes_count
                );
                continue;
            };

            set_bit(&mut bitmap, bit);
            self.write_block(desc.inode_bitmap, &bitmap)?;

            let desc = &mut alloc.groups[group as usize];
            desc.free_inodes_count -= 1;
            if is_dir {
                desc.used_dirs_count = desc.used_dirs_count.saturating_add(1);
            }
            let desc = *desc;
            alloc.free_inodes = alloc.free_inodes.saturating_sub(1);
            self.persist_group(group, &desc)?;
            self.persist_counters(&alloc)?;

            let ino = base + bit + 1;
            debug!("ext2: allocated inode {} in group {}", ino, group);
            return Ok(ino);
        }

        Err(FsError::NoSpace)
    }

    #[cfg(test)]
    pub(crate) fn used_dirs(&self, group: u32) -> u16 {
        self.alloc.lock().groups[group as usize].used_dirs_count
    }
}
