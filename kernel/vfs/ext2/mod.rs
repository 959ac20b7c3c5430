//! Ext2 filesystem engine
//!
//! One engine serves every backing medium: the volume is reached through a
//! [`BlockAdapter`] and all block traffic goes through a per-mount
//! [`BlockCache`].
//!
//! ```text
//! Ext2Inode (node interface)
//!     |
//!     +-- dir.rs       directory records
//!     +-- blockmap.rs  logical -> physical block, on-demand allocation
//!     +-- group.rs     inode table, bitmaps, group descriptors
//!     |
//! BlockCache (LRU, write-back)
//!     |
//! BlockAdapter -> BlockDevice
//! ```
//!
//! Lock order: `io_lock` -> `alloc` -> cache. `io_lock` serializes every
//! operation on an instance; helpers below it never take it again.
//!
//! A failed write-back flips the instance read-only. Reads keep working,
//! mutations fail with [`FsError::ReadOnly`].

mod blockmap;
mod cache;
mod dir;
mod group;
mod inode;
mod layout;
#[cfg(test)]
pub(crate) mod mkfs;

pub use cache::{BlockCache, CacheError, CacheStats};
pub use inode::Ext2Inode;
pub use layout::{GroupDesc, RawInode, Superblock};

use crate::node::FsNode;
use crate::traits::{FileSystem, Inode};
use crate::types::{FsError, TimeSpec};
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use block::BlockAdapter;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use log::{error, info, warn};
use spin::Mutex;

// ============================================================================
// Constants
// ============================================================================

/// Ext2 magic number
pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;

/// Superblock offset from partition start
pub const SUPERBLOCK_OFFSET: u64 = 1024;

/// Root inode number
pub const EXT2_ROOT_INO: u32 = 2;

/// First non-reserved inode on revision 0 filesystems
pub const EXT2_GOOD_OLD_FIRST_INO: u32 = 11;

/// Inode record size on revision 0 filesystems
pub const EXT2_GOOD_OLD_INODE_SIZE: u32 = 128;

/// Block pointers in an inode
pub const EXT2_N_BLOCKS: usize = 15;

/// Number of direct blocks in inode
pub const EXT2_NDIR_BLOCKS: usize = 12;

/// Indirect block index
pub const EXT2_IND_BLOCK: usize = 12;

/// Double indirect block index
pub const EXT2_DIND_BLOCK: usize = 13;

/// Triple indirect block index
pub const EXT2_TIND_BLOCK: usize = 14;

/// Longest directory entry name
pub const EXT2_NAME_LEN: usize = 255;

/// Directory entry file types
pub const EXT2_FT_UNKNOWN: u8 = 0;
pub const EXT2_FT_REG_FILE: u8 = 1;
pub const EXT2_FT_DIR: u8 = 2;
pub const EXT2_FT_CHRDEV: u8 = 3;
pub const EXT2_FT_BLKDEV: u8 = 4;
pub const EXT2_FT_FIFO: u8 = 5;
pub const EXT2_FT_SOCK: u8 = 6;
pub const EXT2_FT_SYMLINK: u8 = 7;

/// Incompatible feature: directory entries carry a file type
pub const EXT2_FEATURE_INCOMPAT_FILETYPE: u32 = 0x0002;

/// Read-only compatible features this engine can write without breaking
pub const EXT2_FEATURE_RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;
pub const EXT2_FEATURE_RO_COMPAT_LARGE_FILE: u32 = 0x0002;
const RO_COMPAT_SUPPORTED: u32 =
    EXT2_FEATURE_RO_COMPAT_SPARSE_SUPER | EXT2_FEATURE_RO_COMPAT_LARGE_FILE;

/// Default cache capacity in blocks
pub const DEFAULT_CACHE_BLOCKS: usize = 512;

/// Smallest cache the engine runs with
pub const MIN_CACHE_BLOCKS: usize = 16;

/// Global filesystem ID counter
static NEXT_FS_ID: AtomicU64 = AtomicU64::new(100);

// ============================================================================
// Mount options
// ============================================================================

/// Options parsed from a mount argument
/// `"<device>[,ro|rw][,cache=<blocks>][,offset=<bytes>]"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    pub device: String,
    pub read_only: bool,
    pub cache_blocks: usize,
    /// Partition start in bytes
    pub offset: u64,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            device: String::new(),
            read_only: false,
            cache_blocks: DEFAULT_CACHE_BLOCKS,
            offset: 0,
        }
    }
}

impl MountOptions {
    pub fn parse(arg: &str) -> Result<Self, FsError> {
        let mut parts = arg.split(',');
        let device = parts.next().unwrap_or("").trim();
        if device.is_empty() {
            return Err(FsError::Invalid);
        }
        let mut opts = Self {
            device: String::from(device),
            ..Self::default()
        };

        for part in parts.map(str::trim).filter(|p| !p.is_empty()) {
            match part.split_once('=') {
                None if part == "ro" => opts.read_only = true,
                None if part == "rw" => opts.read_only = false,
                Some(("cache", v)) => {
                    opts.cache_blocks = v.parse().map_err(|_| FsError::Invalid)?;
                }
                Some(("offset", v)) => {
                    opts.offset = v.parse().map_err(|_| FsError::Invalid)?;
                }
                _ => return Err(FsError::Invalid),
            }
        }
        Ok(opts)
    }

    /// Cache lines for a given block size.
    pub fn effective_cache_blocks(&self, block_size: u32) -> usize {
        let lines = if block_size > 2048 {
            self.cache_blocks / 2
        } else {
            self.cache_blocks
        };
        lines.max(MIN_CACHE_BLOCKS)
    }
}

// ============================================================================
// Filesystem instance
// ============================================================================

/// Allocation state guarded by `Ext2Fs::alloc`
pub(crate) struct AllocState {
    pub free_blocks: u32,
    pub free_inodes: u32,
    pub groups: Vec<GroupDesc>,
}

/// A mounted ext2 volume
pub struct Ext2Fs {
    fs_id: u64,
    sb: Superblock,
    block_size: u32,
    groups_count: u32,
    inode_size: u32,
    first_ino: u32,
    /// Block holding the first group descriptor
    bgdt_block: u32,
    filetype: bool,
    cache: BlockCache,
    alloc: Mutex<AllocState>,
    io_lock: Mutex<()>,
    read_only: AtomicBool,
    self_ref: Weak<Ext2Fs>,
}

impl Ext2Fs {
    /// Mount the ext2 volume behind `adapter`.
    pub fn mount(mut adapter: BlockAdapter, opts: &MountOptions) -> Result<Arc<Self>, FsError> {
        let mut raw_sb = [0u8; layout::SUPERBLOCK_SIZE];
        adapter.read_bytes(SUPERBLOCK_OFFSET, &mut raw_sb)?;
        let sb = Superblock::parse(&raw_sb)?;
        sb.validate()?;

        let incompat = sb.feature_incompat & !EXT2_FEATURE_INCOMPAT_FILETYPE;
        if incompat != 0 {
            warn!("ext2: unsupported incompatible features {:#x}", incompat);
            return Err(FsError::NotSupported);
        }

        let mut read_only = opts.read_only || adapter.is_read_only();
        let ro_compat = sb.feature_ro_compat & !RO_COMPAT_SUPPORTED;
        if ro_compat != 0 && !read_only {
            warn!(
                "ext2: unknown read-only features {:#x}, mounting read-only",
                ro_compat
            );
            read_only = true;
        }

        let block_size = sb.block_size().ok_or(FsError::Corrupt)?;
        adapter.set_block_size(block_size)?;
        if (sb.blocks_count as u64) > adapter.block_count() {
            return Err(FsError::Corrupt);
        }

        let groups_count = sb.groups_count();
        let bgdt_block = if block_size == 1024 { 2 } else { 1 };
        let cache = BlockCache::new(adapter, opts.effective_cache_blocks(block_size));

        let groups = load_group_descs(&cache, &sb, bgdt_block, groups_count)?;

        let fs = Arc::new_cyclic(|me| Self {
            fs_id: NEXT_FS_ID.fetch_add(1, Ordering::SeqCst),
            sb,
            block_size,
            groups_count,
            inode_size: sb.inode_size(),
            first_ino: sb.first_ino(),
            bgdt_block,
            filetype: sb.feature_incompat & EXT2_FEATURE_INCOMPAT_FILETYPE != 0,
            cache,
            alloc: Mutex::new(AllocState {
                free_blocks: sb.free_blocks_count,
                free_inodes: sb.free_inodes_count,
                groups,
            }),
            io_lock: Mutex::new(()),
            read_only: AtomicBool::new(read_only),
            self_ref: me.clone(),
        });

        let root = fs.read_inode(EXT2_ROOT_INO)?;
        if !root.is_dir() {
            return Err(FsError::Corrupt);
        }

        info!(
            "ext2: mounted {} ({} blocks of {} bytes, {} groups{})",
            opts.device,
            sb.blocks_count,
            block_size,
            groups_count,
            if read_only { ", read-only" } else { "" }
        );
        Ok(fs)
    }

    #[inline]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[inline]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    #[inline]
    pub fn groups_count(&self) -> u32 {
        self.groups_count
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Current (free blocks, free inodes) counters.
    pub fn free_counts(&self) -> (u32, u32) {
        let alloc = self.alloc.lock();
        (alloc.free_blocks, alloc.free_inodes)
    }

    /// Snapshot of a group descriptor.
    pub fn group_desc(&self, group: u32) -> Option<GroupDesc> {
        self.alloc.lock().groups.get(group as usize).copied()
    }

    /// Node for inode `ino`.
    pub fn inode(self: &Arc<Self>, ino: u32) -> Arc<Ext2Inode> {
        Ext2Inode::new(Arc::clone(self), ino)
    }

    /// Root directory node.
    pub fn root(self: &Arc<Self>) -> Arc<Ext2Inode> {
        self.inode(EXT2_ROOT_INO)
    }

    #[inline]
    pub(crate) fn sectors_per_block(&self) -> u32 {
        self.block_size / 512
    }

    #[inline]
    pub(crate) fn has_filetype(&self) -> bool {
        self.filetype
    }

    pub(crate) fn lock_io(&self) -> spin::MutexGuard<'_, ()> {
        self.io_lock.lock()
    }

    pub(crate) fn ensure_writable(&self) -> Result<(), FsError> {
        if self.is_read_only() {
            Err(FsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    pub(crate) fn now(&self) -> u32 {
        TimeSpec::now().sec as u32
    }

    // ------------------------------------------------------------------------
    // Block access through the cache
    // ------------------------------------------------------------------------

    /// Data or metadata block referenced from an inode or descriptor.
    pub(crate) fn read_block(&self, block: u32) -> Result<Vec<u8>, FsError> {
        self.check_block(block)?;
        self.load(block)
    }

    pub(crate) fn write_block(&self, block: u32, data: &[u8]) -> Result<(), FsError> {
        self.check_block(block)?;
        self.store(block, data)
    }

    /// Block pointers must land inside the volume.
    fn check_block(&self, block: u32) -> Result<(), FsError> {
        if block == 0 || block >= self.sb.blocks_count {
            return Err(FsError::Corrupt);
        }
        Ok(())
    }

    fn load(&self, block: u32) -> Result<Vec<u8>, FsError> {
        self.cache.read(block).map_err(|e| self.cache_failure(e))
    }

    fn store(&self, block: u32, data: &[u8]) -> Result<(), FsError> {
        self.ensure_writable()?;
        self.cache.put(block, data).map_err(|e| self.cache_failure(e))
    }

    /// Map a cache error to the caller-visible error. A failed write-back
    /// leaves the instance read-only.
    fn cache_failure(&self, err: CacheError) -> FsError {
        match err {
            CacheError::Read(e) => FsError::from(e),
            CacheError::WriteBack { .. } | CacheError::Flush(_) => {
                if !self.read_only.swap(true, Ordering::AcqRel) {
                    error!(
                        "ext2: fs {}: {}, filesystem is now read-only",
                        self.fs_id, err
                    );
                }
                FsError::Io
            }
        }
    }

    // ------------------------------------------------------------------------
    // Superblock and descriptor persistence
    // ------------------------------------------------------------------------

    /// Patch the on-disk free counters.
    pub(crate) fn persist_counters(&self, alloc: &AllocState) -> Result<(), FsError> {
        let bs = self.block_size as u64;
        let block = (SUPERBLOCK_OFFSET / bs) as u32;
        let offset = (SUPERBLOCK_OFFSET % bs) as usize;
        let mut buf = self.load(block)?;
        Superblock::patch_counters(
            &mut buf[offset..offset + layout::SUPERBLOCK_SIZE],
            alloc.free_blocks,
            alloc.free_inodes,
            self.now(),
        );
        self.store(block, &buf)
    }

    /// Write back the descriptor of `group` in place.
    pub(crate) fn persist_group(&self, group: u32, desc: &GroupDesc) -> Result<(), FsError> {
        let per_block = self.block_size as usize / layout::GROUP_DESC_SIZE;
        let block = self.bgdt_block + (group as usize / per_block) as u32;
        let offset = (group as usize % per_block) * layout::GROUP_DESC_SIZE;
        let mut buf = self.load(block)?;
        desc.encode_into(&mut buf[offset..offset + layout::GROUP_DESC_SIZE]);
        self.store(block, &buf)
    }

    fn flush(&self) -> Result<usize, FsError> {
        self.cache.flush_all().map_err(|e| self.cache_failure(e))
    }
}

fn load_group_descs(
    cache: &BlockCache,
    sb: &Superblock,
    bgdt_block: u32,
    groups_count: u32,
) -> Result<Vec<GroupDesc>, FsError> {
    let block_size = cache.block_size();
    let per_block = block_size / layout::GROUP_DESC_SIZE;
    let table_blocks = (groups_count as usize + per_block - 1) / per_block;
    if bgdt_block as usize + table_blocks > sb.blocks_count as usize {
        return Err(FsError::Corrupt);
    }

    let mut groups = Vec::with_capacity(groups_count as usize);
    let mut buf = Vec::new();
    for g in 0..groups_count as usize {
        if g % per_block == 0 {
            buf = cache
                .read(bgdt_block + (g / per_block) as u32)
                .map_err(|e| match e {
                    CacheError::Read(e) => FsError::from(e),
                    _ => FsError::Io,
                })?;
        }
        let off = (g % per_block) * layout::GROUP_DESC_SIZE;
        let desc = GroupDesc::parse(&buf[off..off + layout::GROUP_DESC_SIZE]);
        let in_range = |b: u32| b != 0 && b < sb.blocks_count;
        if !in_range(desc.block_bitmap)
            || !in_range(desc.inode_bitmap)
            || !in_range(desc.inode_table)
        {
            return Err(FsError::Corrupt);
        }
        groups.push(desc);
    }
    Ok(groups)
}

impl FileSystem for Ext2Fs {
    fn fs_id(&self) -> u64 {
        self.fs_id
    }

    fn fs_type(&self) -> &'static str {
        "ext2"
    }

    fn root_inode(&self) -> Result<Arc<dyn Inode>, FsError> {
        let fs = self.self_ref.upgrade().ok_or(FsError::Io)?;
        Ok(fs.root())
    }

    fn sync(&self) -> Result<(), FsError> {
        let _guard = self.io_lock.lock();
        let written = self.flush()?;
        if written > 0 {
            info!("ext2: fs {}: flushed {} blocks", self.fs_id, written);
        }
        Ok(())
    }
}

impl Drop for Ext2Fs {
    fn drop(&mut self) {
        if let Err(e) = self.cache.flush_all() {
            error!("ext2: fs {}: flush on unmount failed: {}", self.fs_id, e);
        }
    }
}

/// `mount_type("ext2", arg, mountpoint)` entry point.
pub fn mount_callback(arg: &str, _mountpoint: &str) -> Result<Option<Arc<FsNode>>, FsError> {
    let opts = MountOptions::parse(arg)?;
    let dev = block::get_device(&opts.device).ok_or(FsError::NoDevice)?;
    let adapter = BlockAdapter::new(dev, 1024, opts.offset).map_err(|_| FsError::Invalid)?;
    let fs = Ext2Fs::mount(adapter, &opts)?;
    let root: Arc<dyn Inode> = fs.root();
    FsNode::from_inode("/", root).map(Some)
}
