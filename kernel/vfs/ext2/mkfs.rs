//! In-memory image builder for tests
//!
//! Produces a minimal revision 1 volume: every group carries its bitmaps
//! and inode table, group 0 additionally the superblock, the descriptor
//! table and the root directory block. Inodes 1 to 10 are reserved.

use super::layout::{self, write_dirent, GroupDesc, RawInode, Superblock};
use super::{
    Ext2Fs, MountOptions, EXT2_FEATURE_INCOMPAT_FILETYPE, EXT2_FT_DIR, EXT2_ROOT_INO,
    EXT2_SUPER_MAGIC, SUPERBLOCK_OFFSET,
};
use crate::types::FileType;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use block::{BlockAdapter, BlockDevice, RamDisk};

const RESERVED_INODES: u32 = 10;

#[derive(Debug, Clone, Copy)]
pub(crate) struct ImageSpec {
    pub block_size: u32,
    pub groups: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub filetype: bool,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            block_size: 1024,
            groups: 2,
            blocks_per_group: 1024,
            inodes_per_group: 128,
            inode_size: 128,
            filetype: true,
        }
    }
}

fn set_bits(bitmap: &mut [u8], range: core::ops::Range<u32>) {
    for bit in range {
        bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
    }
}

fn block_mut(img: &mut [u8], bs: usize, block: u32) -> &mut [u8] {
    let start = block as usize * bs;
    &mut img[start..start + bs]
}

/// Build a fresh image.
pub(crate) fn build(spec: &ImageSpec) -> Vec<u8> {
    let bs = spec.block_size as usize;
    let first_data_block = if spec.block_size == 1024 { 1 } else { 0 };
    let bpg = spec.blocks_per_group;
    let ipg = spec.inodes_per_group;
    let blocks_count = first_data_block + spec.groups * bpg;
    let gdt_blocks = (spec.groups as usize * layout::GROUP_DESC_SIZE + bs - 1) / bs;
    let table_blocks = (ipg as usize * spec.inode_size as usize + bs - 1) / bs;
    let bits = spec.block_size * 8;

    let mut img = vec![0u8; blocks_count as usize * bs];
    let mut descs = Vec::new();
    let mut root_block = 0;

    for g in 0..spec.groups {
        let start = first_data_block + g * bpg;
        let mut next = start;
        if g == 0 {
            // superblock and descriptor table
            next += 1 + gdt_blocks as u32;
        }
        let block_bitmap = next;
        let inode_bitmap = next + 1;
        let inode_table = next + 2;
        next = inode_table + table_blocks as u32;
        if g == 0 {
            root_block = next;
            next += 1;
        }

        let used_blocks = next - start;
        let bitmap = block_mut(&mut img, bs, block_bitmap);
        set_bits(bitmap, 0..used_blocks);
        set_bits(bitmap, bpg..bits);

        let used_inodes = if g == 0 { RESERVED_INODES } else { 0 };
        let bitmap = block_mut(&mut img, bs, inode_bitmap);
        set_bits(bitmap, 0..used_inodes);
        set_bits(bitmap, ipg..bits);

        descs.push(GroupDesc {
            block_bitmap,
            inode_bitmap,
            inode_table,
            free_blocks_count: (bpg - used_blocks) as u16,
            free_inodes_count: (ipg - used_inodes) as u16,
            used_dirs_count: if g == 0 { 1 } else { 0 },
        });
    }

    let sb = Superblock {
        inodes_count: spec.groups * ipg,
        blocks_count,
        r_blocks_count: 0,
        free_blocks_count: descs.iter().map(|d| d.free_blocks_count as u32).sum(),
        free_inodes_count: descs.iter().map(|d| d.free_inodes_count as u32).sum(),
        first_data_block,
        log_block_size: spec.block_size.trailing_zeros() - 10,
        blocks_per_group: bpg,
        inodes_per_group: ipg,
        mtime: 0,
        wtime: 0,
        magic: EXT2_SUPER_MAGIC,
        state: 1,
        rev_level: 1,
        first_ino: RESERVED_INODES + 1,
        inode_size: spec.inode_size,
        feature_compat: 0,
        feature_incompat: if spec.filetype {
            EXT2_FEATURE_INCOMPAT_FILETYPE
        } else {
            0
        },
        feature_ro_compat: 0,
    };
    let sb_start = SUPERBLOCK_OFFSET as usize;
    sb.encode_into(&mut img[sb_start..sb_start + layout::SUPERBLOCK_SIZE]);

    let gdt_start = (first_data_block as usize + 1) * bs;
    for (g, desc) in descs.iter().enumerate() {
        let off = gdt_start + g * layout::GROUP_DESC_SIZE;
        desc.encode_into(&mut img[off..off + layout::GROUP_DESC_SIZE]);
    }

    // root directory
    let ft = if spec.filetype { EXT2_FT_DIR } else { 0 };
    let dir = block_mut(&mut img, bs, root_block);
    write_dirent(dir, 0, EXT2_ROOT_INO, 12, b".", ft);
    write_dirent(dir, 12, EXT2_ROOT_INO, bs - 12, b"..", ft);

    let mut root = RawInode::new(FileType::Directory, 0o755, 0);
    root.links_count = 2;
    root.set_size(bs as u64);
    root.blocks = spec.block_size / 512;
    root.block[0] = root_block;
    let off = descs[0].inode_table as usize * bs
        + (EXT2_ROOT_INO - 1) as usize * spec.inode_size as usize;
    root.encode_into(&mut img[off..off + 128]);

    img
}

fn mount_disk(disk: &Arc<RamDisk>) -> Arc<Ext2Fs> {
    let dev: Arc<dyn BlockDevice> = disk.clone();
    let adapter = BlockAdapter::new(dev, 1024, 0).unwrap();
    let opts = MountOptions {
        device: "ram-test".into(),
        ..MountOptions::default()
    };
    Ext2Fs::mount(adapter, &opts).unwrap()
}

/// Build an image, wrap it in a RAM disk and mount it.
pub(crate) fn mount_fresh(spec: ImageSpec) -> (Arc<Ext2Fs>, Arc<RamDisk>) {
    let disk = Arc::new(RamDisk::new("ram-test", build(&spec)));
    (mount_disk(&disk), disk)
}

/// Mount the current contents of `disk` as a new instance.
pub(crate) fn remount(disk: &Arc<RamDisk>) -> Arc<Ext2Fs> {
    mount_disk(disk)
}

#[test]
fn test_built_image_counters_match_bitmaps() {
    let spec = ImageSpec::default();
    let img = build(&spec);
    let bs = spec.block_size as usize;
    let sb = Superblock::parse(&img[1024..2048]).unwrap();
    sb.validate().unwrap();

    let mut free_blocks = 0;
    for g in 0..spec.groups as usize {
        let off = 2 * bs + g * layout::GROUP_DESC_SIZE;
        let desc = GroupDesc::parse(&img[off..off + layout::GROUP_DESC_SIZE]);
        let bitmap = &img[desc.block_bitmap as usize * bs..][..bs];
        let clear = (0..spec.blocks_per_group)
            .filter(|&b| bitmap[(b / 8) as usize] & (1 << (b % 8)) == 0)
            .count() as u16;
        assert_eq!(clear, desc.free_blocks_count);
        free_blocks += clear as u32;
    }
    assert_eq!(free_blocks, sb.free_blocks_count);
    assert_eq!(sb.free_inodes_count, spec.groups * spec.inodes_per_group - 10);
}
