//! Filesystem node handles
//!
//! An [`FsNode`] is the handle the VFS hands out for any node in the
//! namespace. It caches the node's name, type flags and permission data and
//! forwards operations to the node's [`Inode`] implementation.
//!
//! Handle lifetime is explicit:
//!
//! ```text
//!   Owned --open--> Shared(1) --open--> Shared(n+1)
//!     ^                 |
//!     +----last close---+   (Inode::close hook runs)
//!
//!   Pinned: mount roots; open/close never change it
//! ```

use crate::traits::Inode;
use crate::types::{DirEntry, FileType, FsError, OpenFlags, Stat};
use alloc::string::String;
use alloc::sync::Arc;
use log::{trace, warn};
use spin::{Mutex, RwLock};

bitflags::bitflags! {
    /// Node type flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u32 {
        const FILE        = 0x01;
        const DIRECTORY   = 0x02;
        const CHARDEVICE  = 0x04;
        const BLOCKDEVICE = 0x08;
        const PIPE        = 0x10;
        const SYMLINK     = 0x20;
        const MOUNTPOINT  = 0x40;
        const SOCKET      = 0x80;
    }
}

impl NodeFlags {
    pub fn from_file_type(file_type: FileType) -> Self {
        match file_type {
            FileType::Regular => NodeFlags::FILE,
            FileType::Directory => NodeFlags::DIRECTORY,
            FileType::CharDevice => NodeFlags::CHARDEVICE,
            FileType::BlockDevice => NodeFlags::BLOCKDEVICE,
            FileType::Symlink => NodeFlags::SYMLINK,
            FileType::Fifo => NodeFlags::PIPE,
            FileType::Socket => NodeFlags::SOCKET,
        }
    }
}

/// Handle ownership state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// Held by a single owner, not opened.
    Owned,
    /// Opened; the count is the number of outstanding opens.
    Shared(usize),
    /// Never released (mount roots).
    Pinned,
}

/// Result of [`FsNode::close`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Other opens remain.
    StillOpen(usize),
    /// The last open was released and the close hook ran.
    Released,
    /// Pinned node, nothing to do.
    Pinned,
    /// Closed without a matching open.
    NotOpen,
}

/// Cached permission data
#[derive(Debug, Clone, Copy)]
struct NodeAttrs {
    mask: u16,
    uid: u32,
    gid: u32,
}

/// VFS node handle
pub struct FsNode {
    name: String,
    ino: u64,
    flags: NodeFlags,
    attrs: RwLock<NodeAttrs>,
    ops: Arc<dyn Inode>,
    lifetime: Mutex<Lifetime>,
}

impl FsNode {
    /// Build an unopened handle for `ops`.
    pub fn from_inode(name: &str, ops: Arc<dyn Inode>) -> Result<Arc<Self>, FsError> {
        let stat = ops.stat()?;
        Ok(Arc::new(Self {
            name: String::from(name),
            ino: stat.ino,
            flags: NodeFlags::from_file_type(stat.mode.file_type),
            attrs: RwLock::new(NodeAttrs {
                mask: stat.mode.perm,
                uid: stat.uid,
                gid: stat.gid,
            }),
            ops,
            lifetime: Mutex::new(Lifetime::Owned),
        }))
    }

    /// Fresh unopened copy sharing the same inode.
    ///
    /// Resolution walks from copies of mount roots so that pinned roots are
    /// never handed to callers directly.
    pub fn detached(&self) -> Arc<Self> {
        Arc::new(Self {
            name: self.name.clone(),
            ino: self.ino,
            flags: self.flags,
            attrs: RwLock::new(*self.attrs.read()),
            ops: Arc::clone(&self.ops),
            lifetime: Mutex::new(Lifetime::Owned),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn ino(&self) -> u64 {
        self.ino
    }

    #[inline]
    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    pub fn mask(&self) -> u16 {
        self.attrs.read().mask
    }

    pub fn uid(&self) -> u32 {
        self.attrs.read().uid
    }

    pub fn gid(&self) -> u32 {
        self.attrs.read().gid
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.flags.contains(NodeFlags::DIRECTORY)
    }

    #[inline]
    pub fn is_symlink(&self) -> bool {
        self.flags.contains(NodeFlags::SYMLINK)
    }

    /// Underlying inode implementation.
    pub fn inode(&self) -> &Arc<dyn Inode> {
        &self.ops
    }

    pub fn lifetime(&self) -> Lifetime {
        *self.lifetime.lock()
    }

    /// Pin the handle so it is never released.
    pub fn pin(&self) {
        *self.lifetime.lock() = Lifetime::Pinned;
    }

    /// Take a reference and run the node's open hook.
    pub fn open(&self, flags: OpenFlags) -> Result<(), FsError> {
        {
            let mut lifetime = self.lifetime.lock();
            *lifetime = match *lifetime {
                Lifetime::Owned => Lifetime::Shared(1),
                Lifetime::Shared(n) => Lifetime::Shared(n + 1),
                Lifetime::Pinned => Lifetime::Pinned,
            };
        }
        if let Err(e) = self.ops.open(flags) {
            self.drop_ref();
            return Err(e);
        }
        Ok(())
    }

    /// Another reference to the same handle.
    pub fn clone_handle(self: &Arc<Self>) -> Arc<Self> {
        let mut lifetime = self.lifetime.lock();
        *lifetime = match *lifetime {
            Lifetime::Owned => Lifetime::Shared(1),
            Lifetime::Shared(n) => Lifetime::Shared(n + 1),
            Lifetime::Pinned => Lifetime::Pinned,
        };
        Arc::clone(self)
    }

    /// Release one reference. The last release runs the close hook.
    pub fn close(&self) -> CloseOutcome {
        let outcome = self.drop_ref();
        match outcome {
            CloseOutcome::Released => {
                trace!("vfs: last reference to {} released", self.name);
                self.ops.close();
            }
            CloseOutcome::NotOpen => {
                warn!("vfs: double close of {}", self.name);
            }
            _ => {}
        }
        outcome
    }

    fn drop_ref(&self) -> CloseOutcome {
        let mut lifetime = self.lifetime.lock();
        match *lifetime {
            Lifetime::Pinned => CloseOutcome::Pinned,
            Lifetime::Owned => CloseOutcome::NotOpen,
            Lifetime::Shared(1) => {
                *lifetime = Lifetime::Owned;
                CloseOutcome::Released
            }
            Lifetime::Shared(n) => {
                *lifetime = Lifetime::Shared(n - 1);
                CloseOutcome::StillOpen(n - 1)
            }
        }
    }

    pub fn stat(&self) -> Result<Stat, FsError> {
        self.ops.stat()
    }

    /// Current size in bytes.
    pub fn size(&self) -> Result<u64, FsError> {
        Ok(self.ops.stat()?.size)
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        self.ops.read_at(offset, buf)
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        self.ops.write_at(offset, data)
    }

    pub fn readdir(&self, index: usize) -> Result<Option<DirEntry>, FsError> {
        if !self.is_dir() {
            return Err(FsError::NotDir);
        }
        self.ops.readdir(index)
    }

    /// Look up `name` and wrap the child in an unopened handle.
    pub fn finddir(&self, name: &str) -> Result<Arc<FsNode>, FsError> {
        if !self.is_dir() {
            return Err(FsError::NotDir);
        }
        let child = self.ops.finddir(name)?;
        FsNode::from_inode(name, child)
    }

    pub fn create(&self, name: &str, perm: u16) -> Result<Arc<FsNode>, FsError> {
        if !self.is_dir() {
            return Err(FsError::NotDir);
        }
        let child = self.ops.create(name, perm)?;
        FsNode::from_inode(name, child)
    }

    pub fn mkdir(&self, name: &str, perm: u16) -> Result<Arc<FsNode>, FsError> {
        if !self.is_dir() {
            return Err(FsError::NotDir);
        }
        let child = self.ops.mkdir(name, perm)?;
        FsNode::from_inode(name, child)
    }

    pub fn symlink(&self, target: &str, name: &str) -> Result<(), FsError> {
        if !self.is_dir() {
            return Err(FsError::NotDir);
        }
        self.ops.symlink(target, name)
    }

    pub fn readlink(&self, buf: &mut [u8]) -> Result<usize, FsError> {
        self.ops.readlink(buf)
    }

    pub fn unlink(&self, name: &str) -> Result<(), FsError> {
        if !self.is_dir() {
            return Err(FsError::NotDir);
        }
        self.ops.unlink(name)
    }

    pub fn chmod(&self, perm: u16) -> Result<(), FsError> {
        self.ops.chmod(perm)?;
        self.attrs.write().mask = perm & 0o7777;
        Ok(())
    }

    pub fn chown(&self, uid: u32, gid: u32) -> Result<(), FsError> {
        self.ops.chown(uid, gid)?;
        let mut attrs = self.attrs.write();
        attrs.uid = uid;
        attrs.gid = gid;
        Ok(())
    }
}

impl core::fmt::Debug for FsNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FsNode")
            .field("name", &self.name)
            .field("ino", &self.ino)
            .field("flags", &self.flags)
            .field("lifetime", &self.lifetime())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FileMode, TimeSpec};
    use core::any::Any;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct Probe {
        closes: AtomicUsize,
        fail_open: bool,
    }

    impl Inode for Probe {
        fn ino(&self) -> u64 {
            7
        }
        fn fs_id(&self) -> u64 {
            1
        }
        fn stat(&self) -> Result<Stat, FsError> {
            Ok(Stat {
                dev: 1,
                ino: 7,
                mode: FileMode::regular(0o640),
                nlink: 1,
                uid: 5,
                gid: 6,
                rdev: 0,
                size: 0,
                blksize: 512,
                blocks: 0,
                atime: TimeSpec::default(),
                mtime: TimeSpec::default(),
                ctime: TimeSpec::default(),
            })
        }
        fn open(&self, _flags: OpenFlags) -> Result<(), FsError> {
            if self.fail_open {
                Err(FsError::PermDenied)
            } else {
                Ok(())
            }
        }
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn probe(fail_open: bool) -> Arc<Probe> {
        Arc::new(Probe {
            closes: AtomicUsize::new(0),
            fail_open,
        })
    }

    #[test]
    fn test_attributes_from_stat() {
        let node = FsNode::from_inode("f", probe(false)).unwrap();
        assert_eq!(node.ino(), 7);
        assert_eq!(node.mask(), 0o640);
        assert_eq!((node.uid(), node.gid()), (5, 6));
        assert!(node.flags().contains(NodeFlags::FILE));
        assert_eq!(node.readdir(0), Err(FsError::NotDir));
    }

    #[test]
    fn test_shared_lifetime_runs_close_hook_once() {
        let p = probe(false);
        let node = FsNode::from_inode("f", p.clone()).unwrap();
        assert_eq!(node.lifetime(), Lifetime::Owned);

        node.open(OpenFlags::RDONLY).unwrap();
        let second = node.clone_handle();
        assert_eq!(node.lifetime(), Lifetime::Shared(2));

        assert_eq!(second.close(), CloseOutcome::StillOpen(1));
        assert_eq!(p.closes.load(Ordering::SeqCst), 0);
        assert_eq!(node.close(), CloseOutcome::Released);
        assert_eq!(p.closes.load(Ordering::SeqCst), 1);
        assert_eq!(node.close(), CloseOutcome::NotOpen);
        assert_eq!(p.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pinned_never_released() {
        let p = probe(false);
        let node = FsNode::from_inode("root", p.clone()).unwrap();
        node.pin();
        node.open(OpenFlags::RDONLY).unwrap();
        assert_eq!(node.close(), CloseOutcome::Pinned);
        assert_eq!(node.close(), CloseOutcome::Pinned);
        assert_eq!(node.lifetime(), Lifetime::Pinned);
        assert_eq!(p.closes.load(Ordering::SeqCst), 0);

        let copy = node.detached();
        assert_eq!(copy.lifetime(), Lifetime::Owned);
    }

    #[test]
    fn test_failed_open_drops_reference() {
        let node = FsNode::from_inode("f", probe(true)).unwrap();
        assert_eq!(node.open(OpenFlags::RDONLY), Err(FsError::PermDenied));
        assert_eq!(node.lifetime(), Lifetime::Owned);
    }
}
