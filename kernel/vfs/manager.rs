//! VFS Manager
//!
//! Provides the central VFS operations:
//! - Filesystem type registration and mounting
//! - Path resolution across mount points, with bounded symlink following
//! - Path-level operations (open, stat, readdir, create, mkdir, symlink)
//! - DAC permission checks against the caller's credentials
//!
//! Resolution of a path:
//!
//! ```text
//!   canonicalize(cwd, path)
//!        |
//!   MountTree::locate  -> deepest bound mount + consumed segments
//!        |
//!   finddir per remaining segment
//!        |   symlink? readlink, canonicalize against the path so far,
//!        |            walk again (depth + 1)
//!        v
//!   terminal node -> open(flags)
//! ```

use crate::mapper::MapperInode;
use crate::mount::{MountFlags, MountNode, MountTree};
use crate::node::FsNode;
use crate::path::{canonicalize, components, file_name, join};
use crate::traits::FileSystem;
use crate::types::{Caller, DirEntry, FsError, OpenFlags, Stat};
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use log::{debug, info, trace};
use spin::RwLock;

/// Symlinks followed within one resolution before giving up
pub const MAX_SYMLINK_DEPTH: usize = 8;

/// Longest symlink target the resolver accepts (exclusive)
pub const MAX_SYMLINK_SIZE: usize = 4096;

/// Access bits for [`Vfs::has_permission`]
pub const MAY_READ: u16 = 0o4;
pub const MAY_WRITE: u16 = 0o2;
pub const MAY_EXEC: u16 = 0o1;

/// Mount entry point of a filesystem type.
///
/// Called with the mount argument and the target path. Returning `None`
/// means the request was handled without anything to bind (e.g. a
/// partition mapper registering further devices).
pub type MountCallback = fn(&str, &str) -> Result<Option<Arc<FsNode>>, FsError>;

/// Global VFS state
pub struct Vfs {
    tree: MountTree,
    fs_types: RwLock<BTreeMap<String, MountCallback>>,
}

impl Vfs {
    pub fn new() -> Self {
        Self {
            tree: MountTree::new(),
            fs_types: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn tree(&self) -> &MountTree {
        &self.tree
    }

    // ------------------------------------------------------------------------
    // Filesystem types and mounts
    // ------------------------------------------------------------------------

    /// Register a filesystem type under `name`.
    pub fn register_type(&self, name: &str, callback: MountCallback) -> Result<(), FsError> {
        let mut types = self.fs_types.write();
        if types.contains_key(name) {
            return Err(FsError::Exists);
        }
        types.insert(String::from(name), callback);
        info!("vfs: registered filesystem type {}", name);
        Ok(())
    }

    /// Mount `arg` at `mountpoint` through the registered type `fs_type`.
    pub fn mount_type(&self, fs_type: &str, arg: &str, mountpoint: &str) -> Result<(), FsError> {
        let callback = self
            .fs_types
            .read()
            .get(fs_type)
            .copied()
            .ok_or(FsError::NoDevice)?;

        let Some(root) = callback(arg, mountpoint)? else {
            debug!("vfs: {} handled {} without binding", fs_type, arg);
            return Ok(());
        };

        let mut parts = arg.split(',').map(str::trim);
        let device = parts.next().unwrap_or("");
        let flags = if parts.any(|p| p == "ro") {
            MountFlags::RDONLY
        } else {
            MountFlags::empty()
        };

        let node = self.mount(mountpoint, root);
        node.set_source(fs_type, device, flags);
        info!("vfs: mounted {} ({}) at {}", device, fs_type, mountpoint);
        Ok(())
    }

    /// Bind `root` at `path`, creating namespace nodes on the way. A
    /// previous binding at the same path is replaced.
    pub fn mount(&self, path: &str, root: Arc<FsNode>) -> Arc<MountNode> {
        let path = canonicalize("/", path);
        self.tree.bind(&components(&path), root)
    }

    /// Mount the root directory of `fs` at `path`.
    pub fn mount_fs(&self, path: &str, fs: &dyn FileSystem) -> Result<Arc<MountNode>, FsError> {
        let path = canonicalize("/", path);
        let name = file_name(&path).unwrap_or("/");
        let root = FsNode::from_inode(name, fs.root_inode()?)?;
        Ok(self.tree.bind(&components(&path), root))
    }

    /// Bind a directory listing the mount-tree children of `path`.
    pub fn map_directory(&self, path: &str) -> Result<(), FsError> {
        let path = canonicalize("/", path);
        let node = self.tree.ensure(&components(&path));
        let name = file_name(&path).unwrap_or("/");
        let root = FsNode::from_inode(name, MapperInode::new(Arc::clone(&node)))?;
        self.tree.bind_node(&node, root);
        Ok(())
    }

    /// One line per mount-tree node.
    pub fn dump_tree(&self) -> Vec<String> {
        let lines = self.tree.dump();
        for line in &lines {
            debug!("{}", line);
        }
        lines
    }

    // ------------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------------

    /// Resolve `path` and open the resulting node with `flags`.
    pub fn resolve(
        &self,
        caller: &Caller,
        path: &str,
        flags: OpenFlags,
    ) -> Result<Arc<FsNode>, FsError> {
        let path = canonicalize(&caller.cwd, path);
        let node = self.walk(caller, &path, flags, 0)?;
        node.open(flags)?;
        Ok(node)
    }

    /// Walk a canonical path. Does not open the result.
    fn walk(
        &self,
        caller: &Caller,
        path: &str,
        flags: OpenFlags,
        depth: usize,
    ) -> Result<Arc<FsNode>, FsError> {
        let segments = components(path);
        let (root, consumed) = self.tree.locate(&segments).ok_or(FsError::NotFound)?;
        let mut node = root.detached();

        for (index, segment) in segments.iter().enumerate().skip(consumed) {
            if !node.is_dir() {
                return Err(FsError::NotDir);
            }
            if !self.has_permission(caller, &node, MAY_EXEC) {
                return Err(FsError::PermDenied);
            }

            let next = node.finddir(segment)?;
            let leaf = index + 1 == segments.len();
            node = if !next.is_symlink() {
                next
            } else if leaf && flags.is_nofollow() {
                if !flags.is_path_only() {
                    return Err(FsError::SymlinkLoop);
                }
                next
            } else {
                self.follow(caller, &next, &segments[..index], depth)?
            };
        }

        trace!("vfs: resolved {} to inode {}", path, node.ino());
        Ok(node)
    }

    /// Resolve the target of `link`, found under the directory `parent`.
    fn follow(
        &self,
        caller: &Caller,
        link: &FsNode,
        parent: &[&str],
        depth: usize,
    ) -> Result<Arc<FsNode>, FsError> {
        if depth >= MAX_SYMLINK_DEPTH {
            return Err(FsError::SymlinkLoop);
        }
        let target = read_target(link)?;
        let path = canonicalize(&join(parent), &target);
        trace!(
            "vfs: following {} -> {} (depth {})",
            link.name(),
            path,
            depth + 1
        );
        self.walk(caller, &path, OpenFlags::empty(), depth + 1)
    }

    /// Parent directory and final name of `path`.
    fn split_parent(
        &self,
        caller: &Caller,
        path: &str,
    ) -> Result<(Arc<FsNode>, String), FsError> {
        if path.is_empty() {
            return Err(FsError::Invalid);
        }
        let path = canonicalize(&caller.cwd, path);
        let name = file_name(&path).ok_or(FsError::Exists)?;
        let parent = self.walk(caller, &canonicalize(&path, ".."), OpenFlags::empty(), 0)?;
        if !parent.is_dir() {
            return Err(FsError::NotDir);
        }
        Ok((parent, String::from(name)))
    }

    /// Common checks before adding `name` under `parent`.
    fn check_new_entry(
        &self,
        caller: &Caller,
        parent: &FsNode,
        name: &str,
    ) -> Result<(), FsError> {
        match parent.finddir(name) {
            Ok(_) => return Err(FsError::Exists),
            Err(FsError::NotFound) => {}
            Err(e) => return Err(e),
        }
        if !self.has_permission(caller, parent, MAY_WRITE | MAY_EXEC) {
            return Err(FsError::PermDenied);
        }
        Ok(())
    }

    fn adopt(&self, caller: &Caller, node: &FsNode) -> Result<(), FsError> {
        if caller.is_root() {
            return Ok(());
        }
        node.chown(caller.uid, caller.gid)
    }

    // ------------------------------------------------------------------------
    // Permissions
    // ------------------------------------------------------------------------

    /// DAC check of `access` (`MAY_*` bits) on `node`.
    ///
    /// Owner, group and other bits that apply to the caller are combined.
    /// Root may read and write anything and search any directory, but
    /// executing a file needs at least one execute bit.
    pub fn has_permission(&self, caller: &Caller, node: &FsNode, access: u16) -> bool {
        let mask = node.mask();
        if caller.is_root() {
            if access & MAY_EXEC != 0 && !node.is_dir() {
                return mask & 0o111 != 0;
            }
            return true;
        }

        let mut granted = mask & 0o7;
        if node.uid() == caller.uid {
            granted |= (mask >> 6) & 0o7;
        }
        if caller.in_group(node.gid()) {
            granted |= (mask >> 3) & 0o7;
        }
        granted & access == access
    }

    // ------------------------------------------------------------------------
    // Path operations
    // ------------------------------------------------------------------------

    /// Open `path`, creating a regular file for `CREAT`.
    pub fn open(
        &self,
        caller: &Caller,
        path: &str,
        flags: OpenFlags,
        perm: u16,
    ) -> Result<Arc<FsNode>, FsError> {
        let canonical = canonicalize(&caller.cwd, path);
        let (node, created) = match self.walk(caller, &canonical, flags, 0) {
            Ok(node) => {
                if flags.is_create() && flags.is_exclusive() {
                    return Err(FsError::Exists);
                }
                (node, false)
            }
            Err(FsError::NotFound) if flags.is_create() => {
                (self.create_file(caller, &canonical, perm)?, true)
            }
            Err(e) => return Err(e),
        };

        if flags.contains(OpenFlags::DIRECTORY) && !node.is_dir() {
            return Err(FsError::NotDir);
        }
        if !created && !flags.is_path_only() {
            let mut access = 0;
            if flags.is_readable() {
                access |= MAY_READ;
            }
            if flags.is_writable() {
                access |= MAY_WRITE;
            }
            if !self.has_permission(caller, &node, access) {
                return Err(FsError::PermDenied);
            }
        }

        node.open(flags)?;
        Ok(node)
    }

    /// Create a regular file. The parent must exist.
    pub fn create_file(
        &self,
        caller: &Caller,
        path: &str,
        perm: u16,
    ) -> Result<Arc<FsNode>, FsError> {
        let (parent, name) = self.split_parent(caller, path)?;
        self.check_new_entry(caller, &parent, &name)?;
        let node = match parent.create(&name, caller.apply_umask(perm)) {
            Err(FsError::NotSupported) => return Err(FsError::Invalid),
            other => other?,
        };
        self.adopt(caller, &node)?;
        Ok(node)
    }

    pub fn mkdir(&self, caller: &Caller, path: &str, perm: u16) -> Result<Arc<FsNode>, FsError> {
        let (parent, name) = self.split_parent(caller, path)?;
        self.check_new_entry(caller, &parent, &name)?;
        let node = match parent.mkdir(&name, caller.apply_umask(perm)) {
            Err(FsError::NotSupported) => return Err(FsError::ReadOnly),
            other => other?,
        };
        self.adopt(caller, &node)?;
        Ok(node)
    }

    /// Create `path` as a symlink pointing at `target`.
    pub fn symlink(&self, caller: &Caller, target: &str, path: &str) -> Result<(), FsError> {
        let (parent, name) = self.split_parent(caller, path)?;
        self.check_new_entry(caller, &parent, &name)?;
        match parent.symlink(target, &name) {
            Err(FsError::NotSupported) => Err(FsError::Invalid),
            other => other,
        }
    }

    pub fn unlink(&self, caller: &Caller, path: &str) -> Result<(), FsError> {
        let (parent, name) = self.split_parent(caller, path)?;
        if !self.has_permission(caller, &parent, MAY_WRITE | MAY_EXEC) {
            return Err(FsError::PermDenied);
        }
        parent.unlink(&name)
    }

    /// Target of the symlink at `path`.
    pub fn readlink(&self, caller: &Caller, path: &str) -> Result<String, FsError> {
        let path = canonicalize(&caller.cwd, path);
        let node = self.walk(caller, &path, OpenFlags::NOFOLLOW | OpenFlags::PATH, 0)?;
        if !node.is_symlink() {
            return Err(FsError::Invalid);
        }
        read_target(&node)
    }

    /// All entries of the directory at `path`.
    pub fn readdir(&self, caller: &Caller, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let path = canonicalize(&caller.cwd, path);
        let node = self.walk(caller, &path, OpenFlags::empty(), 0)?;
        if !node.is_dir() {
            return Err(FsError::NotDir);
        }
        if !self.has_permission(caller, &node, MAY_READ) {
            return Err(FsError::PermDenied);
        }

        let mut entries = Vec::new();
        while let Some(entry) = node.readdir(entries.len())? {
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn stat(&self, caller: &Caller, path: &str) -> Result<Stat, FsError> {
        let path = canonicalize(&caller.cwd, path);
        self.walk(caller, &path, OpenFlags::empty(), 0)?.stat()
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

/// Read a link target, bounded by [`MAX_SYMLINK_SIZE`].
fn read_target(link: &FsNode) -> Result<String, FsError> {
    let mut buf = vec![0u8; MAX_SYMLINK_SIZE];
    let len = link.readlink(&mut buf)?;
    if len >= MAX_SYMLINK_SIZE {
        return Err(FsError::SymlinkTooLong);
    }
    buf.truncate(len);
    String::from_utf8(buf).map_err(|_| FsError::Invalid)
}

lazy_static::lazy_static! {
    /// Global VFS instance
    pub static ref VFS: Vfs = Vfs::new();
}

// ============================================================================
// Convenience functions
// ============================================================================

pub fn register_type(name: &str, callback: MountCallback) -> Result<(), FsError> {
    VFS.register_type(name, callback)
}

pub fn mount_type(fs_type: &str, arg: &str, mountpoint: &str) -> Result<(), FsError> {
    VFS.mount_type(fs_type, arg, mountpoint)
}

pub fn map_directory(path: &str) -> Result<(), FsError> {
    VFS.map_directory(path)
}

pub fn resolve(caller: &Caller, path: &str, flags: OpenFlags) -> Result<Arc<FsNode>, FsError> {
    VFS.resolve(caller, path, flags)
}

pub fn open(
    caller: &Caller,
    path: &str,
    flags: OpenFlags,
    perm: u16,
) -> Result<Arc<FsNode>, FsError> {
    VFS.open(caller, path, flags, perm)
}

pub fn mkdir(caller: &Caller, path: &str, perm: u16) -> Result<Arc<FsNode>, FsError> {
    VFS.mkdir(caller, path, perm)
}

pub fn stat(caller: &Caller, path: &str) -> Result<Stat, FsError> {
    VFS.stat(caller, path)
}

pub fn readdir(caller: &Caller, path: &str) -> Result<Vec<DirEntry>, FsError> {
    VFS.readdir(caller, path)
}

pub fn dump_tree() -> Vec<String> {
    VFS.dump_tree()
}
