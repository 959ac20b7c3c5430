//! Logical to physical block mapping
//!
//! With `P = block_size / 4` pointers per block:
//!
//! ```text
//!   [0, 12)                 block[lb]
//!   [12, 12+P)              block[12] -> table
//!   [12+P, 12+P+P^2)        block[13] -> table -> table
//!   [.., +P^3)              block[14] -> table -> table -> table
//! ```
//!
//! A zero pointer is a hole. Files grow contiguously: extending a file
//! allocates every missing block from the current end up to the target,
//! zero-filling all but the target.

use super::layout::{get_u32, put_u32, RawInode};
use super::{Ext2Fs, EXT2_DIND_BLOCK, EXT2_IND_BLOCK, EXT2_NDIR_BLOCKS, EXT2_TIND_BLOCK};
use crate::types::FsError;
use alloc::vec;

/// Route to a logical block: the inode slot and the indices inside each
/// level of indirect table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockPath {
    pub slot: usize,
    pub depth: usize,
    pub index: [u32; 3],
}

impl BlockPath {
    fn indices(&self) -> &[u32] {
        &self.index[..self.depth]
    }
}

/// Route to logical block `lb` with `ptrs` pointers per block.
pub(crate) fn block_path(lb: u64, ptrs: u64) -> Result<BlockPath, FsError> {
    let ndir = EXT2_NDIR_BLOCKS as u64;
    if lb < ndir {
        return Ok(BlockPath {
            slot: lb as usize,
            depth: 0,
            index: [0; 3],
        });
    }

    let rel = lb - ndir;
    if rel < ptrs {
        return Ok(BlockPath {
            slot: EXT2_IND_BLOCK,
            depth: 1,
            index: [rel as u32, 0, 0],
        });
    }

    let rel = rel - ptrs;
    if rel < ptrs * ptrs {
        return Ok(BlockPath {
            slot: EXT2_DIND_BLOCK,
            depth: 2,
            index: [(rel / ptrs) as u32, (rel % ptrs) as u32, 0],
        });
    }

    let rel = rel - ptrs * ptrs;
    if rel < ptrs * ptrs * ptrs {
        return Ok(BlockPath {
            slot: EXT2_TIND_BLOCK,
            depth: 3,
            index: [
                (rel / (ptrs * ptrs)) as u32,
                ((rel / ptrs) % ptrs) as u32,
                (rel % ptrs) as u32,
            ],
        });
    }

    Err(FsError::FileTooLarge)
}

/// Indirect table blocks needed to map `n` contiguous data blocks.
pub(crate) fn metadata_blocks(n: u64, ptrs: u64) -> u64 {
    let ndir = EXT2_NDIR_BLOCKS as u64;
    if n <= ndir {
        return 0;
    }
    let mut meta = 0;

    let n1 = n - ndir;
    meta += 1;

    if n1 > ptrs {
        let n2 = (n1 - ptrs).min(ptrs * ptrs);
        meta += 1 + (n2 + ptrs - 1) / ptrs;
    }

    let single_double = ptrs + ptrs * ptrs;
    if n1 > single_double {
        let n3 = n1 - single_double;
        meta += 1 + (n3 + ptrs * ptrs - 1) / (ptrs * ptrs) + (n3 + ptrs - 1) / ptrs;
    }
    meta
}

/// Data blocks of a contiguously allocated file, derived from its sector
/// count (which also counts indirect tables).
pub(crate) fn data_block_count(sectors: u32, sectors_per_block: u32, ptrs: u64) -> u64 {
    let total = (sectors / sectors_per_block) as u64;
    let (mut lo, mut hi) = (0u64, total);
    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        if mid + metadata_blocks(mid, ptrs) <= total {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    lo
}

impl Ext2Fs {
    #[inline]
    pub(crate) fn ptrs_per_block(&self) -> u64 {
        (self.block_size / 4) as u64
    }

    /// Physical block for logical block `lb`, `None` for a hole.
    pub(crate) fn map_block(&self, raw: &RawInode, lb: u64) -> Result<Option<u32>, FsError> {
        let path = block_path(lb, self.ptrs_per_block())?;
        let mut ptr = raw.block[path.slot];
        for &index in path.indices() {
            if ptr == 0 {
                return Ok(None);
            }
            let table = self.read_block(ptr)?;
            ptr = get_u32(&table, index as usize * 4);
        }
        Ok(if ptr == 0 { None } else { Some(ptr) })
    }

    /// Number of data blocks currently backing `raw`.
    pub(crate) fn allocated_blocks(&self, raw: &RawInode) -> u64 {
        data_block_count(raw.blocks, self.sectors_per_block(), self.ptrs_per_block())
    }

    /// Install `phys` as logical block `lb`, allocating indirect tables on
    /// the way. Every newly allocated table is charged to the inode and the
    /// inode is persisted.
    fn attach(&self, ino: u32, raw: &mut RawInode, lb: u64, phys: u32) -> Result<(), FsError> {
        let path = block_path(lb, self.ptrs_per_block())?;
        if path.depth == 0 {
            raw.block[path.slot] = phys;
            return Ok(());
        }

        if raw.block[path.slot] == 0 {
            raw.block[path.slot] = self.allocate_zeroed_block()?;
            raw.blocks += self.sectors_per_block();
            self.write_inode(ino, raw)?;
        }

        let mut table_no = raw.block[path.slot];
        for (level, &index) in path.indices().iter().enumerate() {
            let mut table = self.read_block(table_no)?;
            let off = index as usize * 4;

            if level + 1 == path.depth {
                put_u32(&mut table, off, phys);
                self.write_block(table_no, &table)?;
                break;
            }

            let mut next = get_u32(&table, off);
            if next == 0 {
                next = self.allocate_zeroed_block()?;
                put_u32(&mut table, off, next);
                self.write_block(table_no, &table)?;
                raw.blocks += self.sectors_per_block();
                self.write_inode(ino, raw)?;
            }
            table_no = next;
        }
        Ok(())
    }

    /// Allocate one data block as logical block `lb`.
    fn grow(&self, ino: u32, raw: &mut RawInode, lb: u64, zero: bool) -> Result<u32, FsError> {
        // range check before anything is allocated
        block_path(lb, self.ptrs_per_block())?;
        let phys = if zero {
            self.allocate_zeroed_block()?
        } else {
            self.allocate_block()?
        };
        self.attach(ino, raw, lb, phys)?;
        raw.blocks += self.sectors_per_block();
        self.write_inode(ino, raw)?;
        Ok(phys)
    }

    /// Make sure logical blocks up to and including `target` exist.
    ///
    /// Returns the physical block for `target` and whether it was allocated
    /// by this call (its previous content is then undefined).
    pub(crate) fn extend_to(
        &self,
        ino: u32,
        raw: &mut RawInode,
        target: u64,
    ) -> Result<(u32, bool), FsError> {
        if let Some(phys) = self.map_block(raw, target)? {
            return Ok((phys, false));
        }

        let frontier = self.allocated_blocks(raw).min(target);
        for lb in frontier..target {
            if self.map_block(raw, lb)?.is_none() {
                self.grow(ino, raw, lb, true)?;
            }
        }
        let phys = self.grow(ino, raw, target, false)?;
        Ok((phys, true))
    }

    /// Zero-filled buffer of one block.
    pub(crate) fn zero_block(&self) -> alloc::vec::Vec<u8> {
        vec![0u8; self.block_size as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext2::mkfs::{self, ImageSpec};
    use crate::types::FileType;

    #[test]
    fn test_block_path_tiers() {
        let p = 256;
        assert_eq!(block_path(11, p).unwrap().slot, 11);
        let single = block_path(12, p).unwrap();
        assert_eq!((single.slot, single.depth, single.index[0]), (12, 1, 0));
        let last_single = block_path(12 + 255, p).unwrap();
        assert_eq!(last_single.index[0], 255);

        let double = block_path(12 + 256, p).unwrap();
        assert_eq!((double.slot, double.indices()), (13, &[0, 0][..]));
        let double = block_path(12 + 256 + 257, p).unwrap();
        assert_eq!(double.indices(), &[1, 1]);

        let triple = block_path(12 + 256 + 65536, p).unwrap();
        assert_eq!((triple.slot, triple.indices()), (14, &[0, 0, 0][..]));
        let end = 12 + 256 + 65536 + 256 * 65536;
        assert_eq!(block_path(end - 1, p).unwrap().indices(), &[255, 255, 255]);
        assert_eq!(block_path(end, p), Err(FsError::FileTooLarge));
    }

    #[test]
    fn test_metadata_blocks() {
        let p = 256;
        assert_eq!(metadata_blocks(12, p), 0);
        assert_eq!(metadata_blocks(13, p), 1);
        assert_eq!(metadata_blocks(12 + 256, p), 1);
        // double indirect root plus its first table
        assert_eq!(metadata_blocks(12 + 257, p), 3);
        assert_eq!(metadata_blocks(12 + 256 + 512, p), 4);
        assert_eq!(metadata_blocks(12 + 256 + 513, p), 5);
        let full_double = 12 + 256 + 65536;
        assert_eq!(metadata_blocks(full_double, p), 1 + 1 + 256);
        // triple root, one second-level table, one leaf table
        assert_eq!(metadata_blocks(full_double + 1, p), 1 + 1 + 256 + 3);
    }

    #[test]
    fn test_data_block_count_inverts_metadata() {
        let p = 256;
        for n in [0u64, 1, 12, 13, 200, 268, 269, 300, 1000, 65804, 65805] {
            let sectors = ((n + metadata_blocks(n, p)) * 2) as u32;
            assert_eq!(data_block_count(sectors, 2, p), n, "n = {}", n);
        }
    }

    #[test]
    fn test_extend_zero_fills_gap() {
        let (fs, _) = mkfs::mount_fresh(ImageSpec::default());
        let ino = fs.allocate_inode(false).unwrap();
        let mut raw = RawInode::new(FileType::Regular, 0o644, 0);
        fs.init_inode(ino, &raw).unwrap();

        // dirty a free block so a reused block would show stale bytes
        let stale = fs.allocate_block().unwrap();
        fs.write_block(stale, &vec![0xEEu8; 1024]).unwrap();

        let (target, fresh) = fs.extend_to(ino, &mut raw, 20).unwrap();
        assert!(fresh);
        assert_eq!(fs.allocated_blocks(&raw), 21);
        assert_eq!(raw.blocks, (21 + 1) * 2);
        assert_eq!(fs.map_block(&raw, 20).unwrap(), Some(target));

        for lb in 0..20 {
            let phys = fs.map_block(&raw, lb).unwrap().unwrap();
            assert_ne!(phys, stale);
            assert!(fs.read_block(phys).unwrap().iter().all(|&b| b == 0));
        }

        // second call finds the existing block
        assert_eq!(fs.extend_to(ino, &mut raw, 20).unwrap(), (target, false));
        assert_eq!(fs.read_inode(ino).unwrap(), raw);
    }

    #[test]
    fn test_extend_into_double_indirect() {
        let (fs, _) = mkfs::mount_fresh(ImageSpec::default());
        let ino = fs.allocate_inode(false).unwrap();
        let mut raw = RawInode::new(FileType::Regular, 0o644, 0);
        fs.init_inode(ino, &raw).unwrap();

        let target = 12 + 256;
        let (phys, _) = fs.extend_to(ino, &mut raw, target).unwrap();
        assert_ne!(raw.block[EXT2_DIND_BLOCK], 0);
        assert_eq!(fs.map_block(&raw, target).unwrap(), Some(phys));
        assert_eq!(fs.allocated_blocks(&raw), target + 1);
        assert_eq!(fs.map_block(&raw, target + 1).unwrap(), None);
    }
}
