//! Mount tree
//!
//! A tree of path segments rooted at `[root]`. Each tree node may be bound
//! to the root handle of a mounted filesystem (or a single grafted node).
//! Unbound nodes are pure namespace directories created on the way to a
//! deeper mount point.
//!
//! The tree is append-only: nodes are never removed, so readers walk it
//! under per-node read locks while writers serialize on a single insert lock.

use crate::node::FsNode;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::{debug, warn};
use spin::{Mutex, RwLock};

/// Name of the tree root entry
pub const ROOT_ENTRY_NAME: &str = "[root]";

bitflags::bitflags! {
    /// Per-mount flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MountFlags: u64 {
        /// Mounted read-only
        const RDONLY = 1 << 0;
    }
}

/// What a tree node is bound to
#[derive(Clone)]
pub struct Binding {
    /// Pinned root handle of the mounted filesystem
    pub root: Arc<FsNode>,
    /// Filesystem type name when mounted through a registered type
    pub fs_type: Option<String>,
    /// Mount argument (device name) when mounted through a registered type
    pub device: Option<String>,
    pub flags: MountFlags,
}

/// A node of the mount tree
pub struct MountNode {
    name: String,
    binding: RwLock<Option<Binding>>,
    children: RwLock<Vec<Arc<MountNode>>>,
}

impl MountNode {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: String::from(name),
            binding: RwLock::new(None),
            children: RwLock::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn binding(&self) -> Option<Binding> {
        self.binding.read().clone()
    }

    pub fn is_bound(&self) -> bool {
        self.binding.read().is_some()
    }

    /// Child tree node by segment name.
    pub fn child(&self, name: &str) -> Option<Arc<MountNode>> {
        self.children
            .read()
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    /// Child names in insertion order.
    pub fn child_names(&self) -> Vec<String> {
        self.children.read().iter().map(|c| c.name.clone()).collect()
    }

    /// Child by position in insertion order.
    pub fn child_at(&self, index: usize) -> Option<Arc<MountNode>> {
        self.children.read().get(index).cloned()
    }

    /// Record the filesystem type and device of the current binding.
    pub fn set_source(&self, fs_type: &str, device: &str, flags: MountFlags) {
        if let Some(binding) = self.binding.write().as_mut() {
            binding.fs_type = Some(String::from(fs_type));
            binding.device = Some(String::from(device));
            binding.flags = flags;
        }
    }
}

/// The mount tree
pub struct MountTree {
    root: Arc<MountNode>,
    insert_lock: Mutex<()>,
}

impl MountTree {
    pub fn new() -> Self {
        Self {
            root: MountNode::new(ROOT_ENTRY_NAME),
            insert_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Arc<MountNode> {
        &self.root
    }

    /// Tree node for `segments`, creating namespace-only nodes as needed.
    pub fn ensure(&self, segments: &[&str]) -> Arc<MountNode> {
        let _guard = self.insert_lock.lock();
        let mut node = Arc::clone(&self.root);
        for segment in segments {
            let next = match node.child(segment) {
                Some(child) => child,
                None => {
                    debug!("vfs: mount tree: creating {}", segment);
                    let child = MountNode::new(segment);
                    node.children.write().push(Arc::clone(&child));
                    child
                }
            };
            node = next;
        }
        node
    }

    /// Bind `root` at `segments`. An existing binding is replaced with a
    /// warning.
    pub fn bind(&self, segments: &[&str], root: Arc<FsNode>) -> Arc<MountNode> {
        let node = self.ensure(segments);
        self.bind_node(&node, root);
        node
    }

    /// Bind `root` to an existing tree node.
    pub fn bind_node(&self, node: &Arc<MountNode>, root: Arc<FsNode>) {
        let _guard = self.insert_lock.lock();
        root.pin();
        let mut binding = node.binding.write();
        if binding.is_some() {
            warn!(
                "vfs: {} already mounted, replacing previous binding",
                node.name
            );
        }
        *binding = Some(Binding {
            root,
            fs_type: None,
            device: None,
            flags: MountFlags::empty(),
        });
    }

    /// Existing tree node for `segments` without creating anything.
    pub fn find(&self, segments: &[&str]) -> Option<Arc<MountNode>> {
        let mut node = Arc::clone(&self.root);
        for segment in segments {
            node = node.child(segment)?;
        }
        Some(node)
    }

    /// Deepest bound node along `segments`.
    ///
    /// Returns the bound root and the number of segments consumed to reach
    /// it, or `None` when nothing along the path (including the tree root) is
    /// bound.
    pub fn locate(&self, segments: &[&str]) -> Option<(Arc<FsNode>, usize)> {
        let mut node = Arc::clone(&self.root);
        let mut last = node.binding().map(|b| (b.root, 0));

        for (depth, segment) in segments.iter().enumerate() {
            match node.child(segment) {
                Some(child) => {
                    if let Some(binding) = child.binding() {
                        last = Some((binding.root, depth + 1));
                    }
                    node = child;
                }
                None => break,
            }
        }
        last
    }

    /// One line per tree node, indented by depth.
    pub fn dump(&self) -> Vec<String> {
        let mut lines = Vec::new();
        dump_node(&self.root, 0, &mut lines);
        lines
    }
}

impl Default for MountTree {
    fn default() -> Self {
        Self::new()
    }
}

fn dump_node(node: &Arc<MountNode>, depth: usize, out: &mut Vec<String>) {
    let mut line = String::new();
    for _ in 0..depth {
        line.push_str("  ");
    }
    line.push_str(&node.name);
    match node.binding() {
        Some(b) => {
            line.push_str(" →");
            if b.fs_type.is_some() || b.device.is_some() {
                line.push(' ');
            }
            if let Some(t) = &b.fs_type {
                line.push_str(t);
            }
            if let Some(d) = &b.device {
                line.push('[');
                line.push_str(d);
                line.push(']');
            }
            line.push_str(" (");
            line.push_str(b.root.name());
            line.push(')');
        }
        None => line.push_str(" → (empty)"),
    }
    out.push(line);

    let children: Vec<Arc<MountNode>> = node.children.read().clone();
    for child in children {
        dump_node(&child, depth + 1, out);
    }
}
