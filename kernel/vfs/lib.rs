//! Virtual File System (VFS) Layer
//!
//! A mount tree and path resolver on top of concrete filesystems. The
//! only block-backed filesystem is the ext2 engine; other node types
//! (mapped directories, device nodes) implement the same [`Inode`]
//! interface and are grafted into the same namespace.
//!
//! # Architecture
//!
//! ```text
//! +-------------------+
//! |   Syscall layer   |  open, stat, mkdir, readdir (outside this crate)
//! +-------------------+
//!          |
//!          v
//! +-------------------+
//! |   VFS Manager     |  canonicalize, mount tree, symlinks, permissions
//! +-------------------+
//!          |
//!    +-----+------+
//!    |            |
//!    v            v
//! +------+   +--------+
//! | ext2 |   | mapper |   Inode implementations
//! +------+   +--------+
//!    |
//!    v
//! BlockCache -> BlockAdapter -> BlockDevice (block crate)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! vfs::init()?;
//! vfs::mount_type("ext2", "ram0", "/")?;
//!
//! let caller = Caller::kernel();
//! let file = vfs::open(&caller, "/etc/motd", OpenFlags::RDONLY, 0)?;
//! let stat = vfs::stat(&caller, "/etc")?;
//! ```

#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub mod ext2;
pub mod manager;
pub mod mapper;
pub mod mount;
pub mod node;
pub mod path;
pub mod traits;
pub mod types;

// Re-exports for convenience
pub use ext2::{Ext2Fs, Ext2Inode, MountOptions};
pub use manager::{
    dump_tree, map_directory, mkdir, mount_type, open, readdir, register_type, resolve, stat,
    MountCallback, Vfs, MAX_SYMLINK_DEPTH, MAX_SYMLINK_SIZE, VFS,
};
pub use mount::{MountFlags, MountTree};
pub use node::{CloseOutcome, FsNode, Lifetime, NodeFlags};
pub use path::canonicalize;
pub use traits::{FileSystem, Inode};
pub use types::{Caller, DirEntry, FileMode, FileType, FsError, OpenFlags, Stat, TimeSpec};

/// Initialize the VFS subsystem
///
/// Registers the built-in filesystem types with the global instance.
pub fn init() -> Result<(), FsError> {
    manager::register_type("ext2", ext2::mount_callback)?;
    log::info!("vfs: initialized");
    Ok(())
}
