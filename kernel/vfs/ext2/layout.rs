//! Ext2 on-disk structures
//!
//! All structures are decoded field by field from little-endian byte
//! buffers. Encoding writes back only the fields this engine understands and
//! leaves every other byte of the on-disk record untouched.

use super::{EXT2_SUPER_MAGIC, EXT2_GOOD_OLD_INODE_SIZE, EXT2_N_BLOCKS};
use crate::types::{FileType, FsError, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};

// ============================================================================
// Little-endian field access
// ============================================================================

#[inline]
pub(crate) fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

#[inline]
pub(crate) fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
pub(crate) fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub(crate) fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

// ============================================================================
// Superblock
// ============================================================================

/// On-disk superblock size
pub const SUPERBLOCK_SIZE: usize = 1024;

mod sb_off {
    pub const INODES_COUNT: usize = 0;
    pub const BLOCKS_COUNT: usize = 4;
    pub const R_BLOCKS_COUNT: usize = 8;
    pub const FREE_BLOCKS: usize = 12;
    pub const FREE_INODES: usize = 16;
    pub const FIRST_DATA_BLOCK: usize = 20;
    pub const LOG_BLOCK_SIZE: usize = 24;
    pub const LOG_FRAG_SIZE: usize = 28;
    pub const BLOCKS_PER_GROUP: usize = 32;
    pub const FRAGS_PER_GROUP: usize = 36;
    pub const INODES_PER_GROUP: usize = 40;
    pub const MTIME: usize = 44;
    pub const WTIME: usize = 48;
    pub const MAX_MNT_COUNT: usize = 54;
    pub const MAGIC: usize = 56;
    pub const STATE: usize = 58;
    pub const ERRORS: usize = 60;
    pub const REV_LEVEL: usize = 76;
    pub const FIRST_INO: usize = 84;
    pub const INODE_SIZE: usize = 88;
    pub const FEATURE_COMPAT: usize = 92;
    pub const FEATURE_INCOMPAT: usize = 96;
    pub const FEATURE_RO_COMPAT: usize = 100;
}

/// Superblock fields used by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub r_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub mtime: u32,
    pub wtime: u32,
    pub magic: u16,
    pub state: u16,
    pub rev_level: u32,
    pub first_ino: u32,
    /// Raw field; zero (or revision 0) means 128
    pub inode_size: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
}

impl Superblock {
    /// Decode a 1024-byte superblock. Fails with `BadMagic` on a magic
    /// mismatch; geometry is checked separately by [`Superblock::validate`].
    pub fn parse(buf: &[u8]) -> Result<Self, FsError> {
        if buf.len() < SUPERBLOCK_SIZE {
            return Err(FsError::Invalid);
        }
        let magic = get_u16(buf, sb_off::MAGIC);
        if magic != EXT2_SUPER_MAGIC {
            return Err(FsError::BadMagic);
        }
        Ok(Self {
            inodes_count: get_u32(buf, sb_off::INODES_COUNT),
            blocks_count: get_u32(buf, sb_off::BLOCKS_COUNT),
            r_blocks_count: get_u32(buf, sb_off::R_BLOCKS_COUNT),
            free_blocks_count: get_u32(buf, sb_off::FREE_BLOCKS),
            free_inodes_count: get_u32(buf, sb_off::FREE_INODES),
            first_data_block: get_u32(buf, sb_off::FIRST_DATA_BLOCK),
            log_block_size: get_u32(buf, sb_off::LOG_BLOCK_SIZE),
            blocks_per_group: get_u32(buf, sb_off::BLOCKS_PER_GROUP),
            inodes_per_group: get_u32(buf, sb_off::INODES_PER_GROUP),
            mtime: get_u32(buf, sb_off::MTIME),
            wtime: get_u32(buf, sb_off::WTIME),
            magic,
            state: get_u16(buf, sb_off::STATE),
            rev_level: get_u32(buf, sb_off::REV_LEVEL),
            first_ino: get_u32(buf, sb_off::FIRST_INO),
            inode_size: get_u16(buf, sb_off::INODE_SIZE),
            feature_compat: get_u32(buf, sb_off::FEATURE_COMPAT),
            feature_incompat: get_u32(buf, sb_off::FEATURE_INCOMPAT),
            feature_ro_compat: get_u32(buf, sb_off::FEATURE_RO_COMPAT),
        })
    }

    /// Block size in bytes, `None` if the shift is out of range.
    pub fn block_size(&self) -> Option<u32> {
        if self.log_block_size > 6 {
            return None;
        }
        Some(1024u32 << self.log_block_size)
    }

    /// Effective inode record stride.
    pub fn inode_size(&self) -> u32 {
        if self.rev_level == 0 || self.inode_size == 0 {
            EXT2_GOOD_OLD_INODE_SIZE
        } else {
            self.inode_size as u32
        }
    }

    /// First inode number available to files.
    pub fn first_ino(&self) -> u32 {
        if self.rev_level == 0 || self.first_ino == 0 {
            super::EXT2_GOOD_OLD_FIRST_INO
        } else {
            self.first_ino
        }
    }

    /// Number of block groups.
    pub fn groups_count(&self) -> u32 {
        let data_blocks = self.blocks_count.saturating_sub(self.first_data_block);
        if self.blocks_per_group == 0 {
            return 0;
        }
        (data_blocks + self.blocks_per_group - 1) / self.blocks_per_group
    }

    /// Structural checks performed at mount.
    pub fn validate(&self) -> Result<(), FsError> {
        let block_size = self.block_size().ok_or(FsError::Corrupt)?;
        let expected_first = if block_size == 1024 { 1 } else { 0 };
        if self.first_data_block != expected_first {
            return Err(FsError::Corrupt);
        }
        if self.blocks_per_group == 0 || self.inodes_per_group == 0 {
            return Err(FsError::Corrupt);
        }
        let bits_per_block = block_size * 8;
        if self.blocks_per_group > bits_per_block || self.inodes_per_group > bits_per_block {
            return Err(FsError::Corrupt);
        }
        if self.blocks_count <= self.first_data_block {
            return Err(FsError::Corrupt);
        }
        let inode_size = self.inode_size();
        if inode_size < EXT2_GOOD_OLD_INODE_SIZE
            || !inode_size.is_power_of_two()
            || inode_size > block_size
        {
            return Err(FsError::Corrupt);
        }
        let max_inodes = (self.groups_count() as u64) * (self.inodes_per_group as u64);
        if self.inodes_count as u64 > max_inodes || self.inodes_count < super::EXT2_ROOT_INO {
            return Err(FsError::Corrupt);
        }
        Ok(())
    }

    /// Write all known fields into a superblock buffer.
    pub fn encode_into(&self, buf: &mut [u8]) {
        put_u32(buf, sb_off::INODES_COUNT, self.inodes_count);
        put_u32(buf, sb_off::BLOCKS_COUNT, self.blocks_count);
        put_u32(buf, sb_off::R_BLOCKS_COUNT, self.r_blocks_count);
        put_u32(buf, sb_off::FREE_BLOCKS, self.free_blocks_count);
        put_u32(buf, sb_off::FREE_INODES, self.free_inodes_count);
        put_u32(buf, sb_off::FIRST_DATA_BLOCK, self.first_data_block);
        put_u32(buf, sb_off::LOG_BLOCK_SIZE, self.log_block_size);
        put_u32(buf, sb_off::LOG_FRAG_SIZE, self.log_block_size);
        put_u32(buf, sb_off::BLOCKS_PER_GROUP, self.blocks_per_group);
        put_u32(buf, sb_off::FRAGS_PER_GROUP, self.blocks_per_group);
        put_u32(buf, sb_off::INODES_PER_GROUP, self.inodes_per_group);
        put_u32(buf, sb_off::MTIME, self.mtime);
        put_u32(buf, sb_off::WTIME, self.wtime);
        put_u16(buf, sb_off::MAX_MNT_COUNT, 0xFFFF);
        put_u16(buf, sb_off::MAGIC, self.magic);
        put_u16(buf, sb_off::STATE, self.state);
        put_u16(buf, sb_off::ERRORS, 1);
        put_u32(buf, sb_off::REV_LEVEL, self.rev_level);
        put_u32(buf, sb_off::FIRST_INO, self.first_ino);
        put_u16(buf, sb_off::INODE_SIZE, self.inode_size);
        put_u32(buf, sb_off::FEATURE_COMPAT, self.feature_compat);
        put_u32(buf, sb_off::FEATURE_INCOMPAT, self.feature_incompat);
        put_u32(buf, sb_off::FEATURE_RO_COMPAT, self.feature_ro_compat);
    }

    /// Patch only the allocation counters and write time into an existing
    /// on-disk superblock.
    pub fn patch_counters(buf: &mut [u8], free_blocks: u32, free_inodes: u32, wtime: u32) {
        put_u32(buf, sb_off::FREE_BLOCKS, free_blocks);
        put_u32(buf, sb_off::FREE_INODES, free_inodes);
        put_u32(buf, sb_off::WTIME, wtime);
    }
}

// ============================================================================
// Block group descriptor
// ============================================================================

/// On-disk descriptor size
pub const GROUP_DESC_SIZE: usize = 32;

/// Block group descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl GroupDesc {
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            block_bitmap: get_u32(buf, 0),
            inode_bitmap: get_u32(buf, 4),
            inode_table: get_u32(buf, 8),
            free_blocks_count: get_u16(buf, 12),
            free_inodes_count: get_u16(buf, 14),
            used_dirs_count: get_u16(buf, 16),
        }
    }

    /// Write the descriptor; padding and reserved bytes are left as they are.
    pub fn encode_into(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.block_bitmap);
        put_u32(buf, 4, self.inode_bitmap);
        put_u32(buf, 8, self.inode_table);
        put_u16(buf, 12, self.free_blocks_count);
        put_u16(buf, 14, self.free_inodes_count);
        put_u16(buf, 16, self.used_dirs_count);
    }
}

// ============================================================================
// Inode
// ============================================================================

/// Inode record (the 128-byte revision 0 layout)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawInode {
    pub mode: u16,
    pub uid: u16,
    pub size_lo: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid: u16,
    pub links_count: u16,
    /// Allocated 512-byte sectors, indirect blocks included
    pub blocks: u32,
    pub flags: u32,
    pub block: [u32; EXT2_N_BLOCKS],
    pub generation: u32,
    pub file_acl: u32,
    /// High 32 bits of the size for regular files
    pub size_high: u32,
    pub uid_high: u16,
    pub gid_high: u16,
}

impl RawInode {
    /// Fresh inode of the given type and permissions.
    pub fn new(file_type: FileType, perm: u16, now: u32) -> Self {
        Self {
            mode: file_type.mode_bits() | (perm & 0o7777),
            atime: now,
            ctime: now,
            mtime: now,
            links_count: 1,
            ..Self::default()
        }
    }

    pub fn parse(buf: &[u8]) -> Self {
        let mut block = [0u32; EXT2_N_BLOCKS];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = get_u32(buf, 40 + i * 4);
        }
        Self {
            mode: get_u16(buf, 0),
            uid: get_u16(buf, 2),
            size_lo: get_u32(buf, 4),
            atime: get_u32(buf, 8),
            ctime: get_u32(buf, 12),
            mtime: get_u32(buf, 16),
            dtime: get_u32(buf, 20),
            gid: get_u16(buf, 24),
            links_count: get_u16(buf, 26),
            blocks: get_u32(buf, 28),
            flags: get_u32(buf, 32),
            block,
            generation: get_u32(buf, 100),
            file_acl: get_u32(buf, 104),
            size_high: get_u32(buf, 108),
            uid_high: get_u16(buf, 120),
            gid_high: get_u16(buf, 122),
        }
    }

    /// Write the record into the first 128 bytes of `buf`. OS-dependent
    /// fields other than the owner high halves are preserved.
    pub fn encode_into(&self, buf: &mut [u8]) {
        put_u16(buf, 0, self.mode);
        put_u16(buf, 2, self.uid);
        put_u32(buf, 4, self.size_lo);
        put_u32(buf, 8, self.atime);
        put_u32(buf, 12, self.ctime);
        put_u32(buf, 16, self.mtime);
        put_u32(buf, 20, self.dtime);
        put_u16(buf, 24, self.gid);
        put_u16(buf, 26, self.links_count);
        put_u32(buf, 28, self.blocks);
        put_u32(buf, 32, self.flags);
        for (i, ptr) in self.block.iter().enumerate() {
            put_u32(buf, 40 + i * 4, *ptr);
        }
        put_u32(buf, 100, self.generation);
        put_u32(buf, 104, self.file_acl);
        put_u32(buf, 108, self.size_high);
        put_u16(buf, 120, self.uid_high);
        put_u16(buf, 122, self.gid_high);
    }

    #[inline]
    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_mode(self.mode)
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    #[inline]
    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    #[inline]
    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    /// Size in bytes. The high word only counts for regular files.
    pub fn size(&self) -> u64 {
        if self.is_regular() {
            ((self.size_high as u64) << 32) | self.size_lo as u64
        } else {
            self.size_lo as u64
        }
    }

    pub fn set_size(&mut self, size: u64) {
        self.size_lo = size as u32;
        if self.is_regular() {
            self.size_high = (size >> 32) as u32;
        }
    }

    pub fn full_uid(&self) -> u32 {
        ((self.uid_high as u32) << 16) | self.uid as u32
    }

    pub fn full_gid(&self) -> u32 {
        ((self.gid_high as u32) << 16) | self.gid as u32
    }

    pub fn set_owner(&mut self, uid: u32, gid: u32) {
        self.uid = uid as u16;
        self.uid_high = (uid >> 16) as u16;
        self.gid = gid as u16;
        self.gid_high = (gid >> 16) as u16;
    }

    /// Block pointer array viewed as bytes (inline symlink storage).
    pub fn block_bytes(&self) -> [u8; EXT2_N_BLOCKS * 4] {
        let mut out = [0u8; EXT2_N_BLOCKS * 4];
        for (i, ptr) in self.block.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&ptr.to_le_bytes());
        }
        out
    }

    /// Store bytes into the block pointer array (inline symlink storage).
    pub fn set_block_bytes(&mut self, data: &[u8]) {
        let mut bytes = [0u8; EXT2_N_BLOCKS * 4];
        let len = data.len().min(bytes.len());
        bytes[..len].copy_from_slice(&data[..len]);
        for (i, slot) in self.block.iter_mut().enumerate() {
            *slot = get_u32(&bytes, i * 4);
        }
    }
}

// ============================================================================
// Directory entry
// ============================================================================

/// Directory entry header length (inode + rec_len + name_len + file_type)
pub const DIRENT_HEADER_LEN: usize = 8;

/// Largest record length representable in the 16-bit field as is.
const MAX_REC_LEN: usize = 0xFFFC;

/// Record length as stored on disk. A record spanning a whole 64 KiB
/// block does not fit in 16 bits and is written as 0xFFFF.
#[inline]
pub fn rec_len_to_disk(len: usize) -> u16 {
    if len > MAX_REC_LEN {
        0xFFFF
    } else {
        len as u16
    }
}

/// Inverse of [`rec_len_to_disk`] for a block of `block_size` bytes.
#[inline]
pub fn rec_len_from_disk(raw: u16, block_size: usize) -> usize {
    if block_size > MAX_REC_LEN && (raw == 0xFFFF || raw == 0) {
        block_size
    } else {
        raw as usize
    }
}

/// Decoded directory entry header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirentHead {
    pub inode: u32,
    pub rec_len: usize,
    pub name_len: u8,
    pub file_type: u8,
}

/// Minimal record length for a name: header + name, rounded up to 4.
#[inline]
pub fn dirent_min_len(name_len: usize) -> usize {
    (DIRENT_HEADER_LEN + name_len + 3) & !3
}

/// Decode and check the entry at `off` inside a directory block.
pub fn parse_dirent(block: &[u8], off: usize) -> Result<DirentHead, FsError> {
    if off + DIRENT_HEADER_LEN > block.len() {
        return Err(FsError::Corrupt);
    }
    let head = DirentHead {
        inode: get_u32(block, off),
        rec_len: rec_len_from_disk(get_u16(block, off + 4), block.len()),
        name_len: block[off + 6],
        file_type: block[off + 7],
    };
    let rec_len = head.rec_len;
    if rec_len < DIRENT_HEADER_LEN
        || rec_len % 4 != 0
        || off + rec_len > block.len()
        || DIRENT_HEADER_LEN + head.name_len as usize > rec_len
    {
        return Err(FsError::Corrupt);
    }
    Ok(head)
}

/// Encode an entry at `off`.
pub fn write_dirent(
    block: &mut [u8],
    off: usize,
    inode: u32,
    rec_len: usize,
    name: &[u8],
    file_type: u8,
) {
    put_u32(block, off, inode);
    put_u16(block, off + 4, rec_len_to_disk(rec_len));
    block[off + 6] = name.len() as u8;
    block[off + 7] = file_type;
    block[off + DIRENT_HEADER_LEN..off + DIRENT_HEADER_LEN + name.len()].copy_from_slice(name);
}
