//! Node identity, attributes, and reference counting.

use crate::registry::path::CachedPath;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::warn;

/// Stable identifier for a live node.
///
/// Identity holds for the registry's lifetime: the same cookie resolves to
/// the same node id until the node is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Filesystem object kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeKind {
    File = 0,
    Dir = 1,
    Symlink = 2,
    Other = 3,
}

impl NodeKind {
    /// Decodes a kind byte, mapping unknown values to `Other`.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => NodeKind::File,
            1 => NodeKind::Dir,
            2 => NodeKind::Symlink,
            _ => NodeKind::Other,
        }
    }
}

/// Cached node attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttr {
    /// Object kind.
    pub kind: NodeKind,
    /// Permission bits.
    pub mode: u32,
    /// Hard link count.
    pub nlink: u32,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Size in bytes.
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub mtime_secs: u64,
}

impl Default for NodeAttr {
    fn default() -> Self {
        Self {
            kind: NodeKind::File,
            mode: 0o644,
            nlink: 1,
            uid: 0,
            gid: 0,
            size: 0,
            mtime_secs: 0,
        }
    }
}

/// One live filesystem object.
///
/// Owns cached attributes, a reference count, and an optional cached
/// absolute path. The private data `D` belongs to the operation table.
pub struct Node<D> {
    id: NodeId,
    cookie: u64,
    data: D,
    attr: Mutex<NodeAttr>,
    refs: AtomicU32,
    path: Mutex<Option<CachedPath>>,
}

impl<D> Node<D> {
    pub(crate) fn new(id: NodeId, cookie: u64, data: D, attr: NodeAttr) -> Self {
        Self {
            id,
            cookie,
            data,
            attr: Mutex::new(attr),
            refs: AtomicU32::new(0),
            path: Mutex::new(None),
        }
    }

    /// Returns the stable node id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Returns the peer-supplied cookie this node was registered under.
    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    /// Returns the operation table's private data.
    pub fn data(&self) -> &D {
        &self.data
    }

    /// Returns a copy of the cached attributes.
    pub fn attr(&self) -> NodeAttr {
        *self.attr.lock()
    }

    /// Replaces the cached attributes.
    pub fn set_attr(&self, attr: NodeAttr) {
        *self.attr.lock() = attr;
    }

    /// Returns the current reference count.
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Increments the reference count, returning the new value.
    pub fn ref_inc(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the reference count, returning the new value.
    ///
    /// A decrement below zero indicates a release that was never matched
    /// by an increment; it is logged and the count stays at zero.
    pub fn ref_dec(&self) -> u32 {
        match self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
        {
            Ok(prev) => prev - 1,
            Err(_) => {
                warn!(node = %self.id, "reference count decrement below zero ignored");
                0
            }
        }
    }

    /// Returns a copy of the cached path, if one is set.
    pub fn cached_path(&self) -> Option<CachedPath> {
        self.path.lock().clone()
    }

    /// Installs a cached path.
    pub fn set_cached_path(&self, path: CachedPath) {
        *self.path.lock() = Some(path);
    }

    /// Drops the cached path.
    pub fn clear_cached_path(&self) {
        *self.path.lock() = None;
    }
}

impl<D> std::fmt::Debug for Node<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("cookie", &self.cookie)
            .field("refs", &self.refs())
            .field("path", &self.cached_path())
            .finish()
    }
}
