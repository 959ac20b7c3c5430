//! Mapped directories
//!
//! A synthetic read-only directory that lists the children of a mount-tree
//! node. Used for namespace directories such as `/dev` that only exist to
//! hold other mounts.

use crate::mount::MountNode;
use crate::traits::Inode;
use crate::types::{DirEntry, FileMode, FileType, FsError, Stat, TimeSpec};
use alloc::string::String;
use alloc::sync::Arc;
use core::any::Any;

/// Filesystem id reported by mapper nodes
pub const MAPPER_FS_ID: u64 = 0;

pub struct MapperInode {
    node: Arc<MountNode>,
    created: TimeSpec,
}

impl MapperInode {
    pub fn new(node: Arc<MountNode>) -> Arc<Self> {
        Arc::new(Self {
            node,
            created: TimeSpec::now(),
        })
    }
}

impl Inode for MapperInode {
    fn ino(&self) -> u64 {
        0
    }

    fn fs_id(&self) -> u64 {
        MAPPER_FS_ID
    }

    fn stat(&self) -> Result<Stat, FsError> {
        Ok(Stat {
            dev: MAPPER_FS_ID,
            ino: 0,
            mode: FileMode::directory(0o555),
            nlink: 2,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: 0,
            blksize: 512,
            blocks: 0,
            atime: self.created,
            mtime: self.created,
            ctime: self.created,
        })
    }

    fn readdir(&self, index: usize) -> Result<Option<DirEntry>, FsError> {
        let entry = |name: &str, ino: u64| DirEntry {
            name: String::from(name),
            ino,
            file_type: FileType::Directory,
        };
        match index {
            0 => Ok(Some(entry(".", 0))),
            1 => Ok(Some(entry("..", 1))),
            n => Ok(self
                .node
                .child_at(n - 2)
                .map(|child| entry(child.name(), (n - 2) as u64))),
        }
    }

    fn finddir(&self, name: &str) -> Result<Arc<dyn Inode>, FsError> {
        let child = self.node.child(name).ok_or(FsError::NotFound)?;
        match child.binding() {
            Some(binding) => Ok(Arc::clone(binding.root.inode())),
            None => Ok(MapperInode::new(child)),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountTree;

    #[test]
    fn test_lists_tree_children() {
        let tree = MountTree::new();
        tree.ensure(&["dev", "null"]);
        tree.ensure(&["dev", "zero"]);
        let dev = tree.find(&["dev"]).unwrap();
        let mapper = MapperInode::new(dev);

        let names: alloc::vec::Vec<String> = (0..)
            .map_while(|i| mapper.readdir(i).unwrap())
            .map(|e| e.name)
            .collect();
        assert_eq!(names, [".", "..", "null", "zero"]);
        assert_eq!(mapper.stat().unwrap().mode.perm, 0o555);
    }

    #[test]
    fn test_finddir_descends_namespace() {
        let tree = MountTree::new();
        tree.ensure(&["a", "b", "c"]);
        let mapper = MapperInode::new(tree.find(&["a"]).unwrap());

        let b = mapper.finddir("b").unwrap();
        assert!(b.readdir(2).unwrap().is_some());
        assert_eq!(mapper.finddir("missing").err(), Some(FsError::NotFound));
    }
}
