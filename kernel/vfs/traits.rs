//! Filesystem and inode interfaces
//!
//! Every node grafted into the namespace (ext2 files, mapped directories,
//! device files) implements [`Inode`]. Operations a node type does not
//! provide fall back to the defaults below.

use crate::types::{DirEntry, FsError, OpenFlags, Stat};
use alloc::sync::Arc;
use core::any::Any;

/// Generic node interface consumed by the VFS.
pub trait Inode: Send + Sync {
    /// Inode number within its filesystem
    fn ino(&self) -> u64;

    /// Owning filesystem id
    fn fs_id(&self) -> u64;

    fn stat(&self) -> Result<Stat, FsError>;

    /// Called when a handle to this node is opened.
    fn open(&self, flags: OpenFlags) -> Result<(), FsError> {
        let _ = flags;
        Ok(())
    }

    /// Called when the last shared handle is released.
    fn close(&self) {}

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let _ = (offset, buf);
        Err(FsError::NotSupported)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        let _ = (offset, data);
        Err(FsError::NotSupported)
    }

    /// Entry number `index` of a directory, `None` past the end.
    fn readdir(&self, index: usize) -> Result<Option<DirEntry>, FsError> {
        let _ = index;
        Err(FsError::NotDir)
    }

    /// Look up a child by name.
    fn finddir(&self, name: &str) -> Result<Arc<dyn Inode>, FsError> {
        let _ = name;
        Err(FsError::NotDir)
    }

    fn create(&self, name: &str, perm: u16) -> Result<Arc<dyn Inode>, FsError> {
        let _ = (name, perm);
        Err(FsError::NotSupported)
    }

    fn mkdir(&self, name: &str, perm: u16) -> Result<Arc<dyn Inode>, FsError> {
        let _ = (name, perm);
        Err(FsError::NotSupported)
    }

    fn symlink(&self, target: &str, name: &str) -> Result<(), FsError> {
        let _ = (target, name);
        Err(FsError::NotSupported)
    }

    /// Copy the link target into `buf`, returning the full target length.
    fn readlink(&self, buf: &mut [u8]) -> Result<usize, FsError> {
        let _ = buf;
        Err(FsError::Invalid)
    }

    fn unlink(&self, name: &str) -> Result<(), FsError> {
        let _ = name;
        Err(FsError::NotSupported)
    }

    fn chmod(&self, perm: u16) -> Result<(), FsError> {
        let _ = perm;
        Ok(())
    }

    fn chown(&self, uid: u32, gid: u32) -> Result<(), FsError> {
        let _ = (uid, gid);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

/// A mounted filesystem instance.
pub trait FileSystem: Send + Sync {
    fn fs_id(&self) -> u64;

    fn fs_type(&self) -> &'static str;

    fn root_inode(&self) -> Result<Arc<dyn Inode>, FsError>;

    /// Persist all cached state to the backing store.
    fn sync(&self) -> Result<(), FsError> {
        Ok(())
    }
}
