//! The operation table.
//!
//! A concrete filesystem supplies a [`FilesystemOps`] implementation; the
//! dispatcher invokes one method per inbound request. Every per-object
//! method has a default body returning `ENOSYS`, so an implementation
//! overrides only what it supports and unset slots behave as "not
//! supported", never as an engine error. Structural defaults are safe
//! no-ops where the protocol allows one.
//!
//! Handlers are async: one that needs more I/O simply awaits, and the
//! request context resumes transparently at the same point.

use crate::error::{Errno, OpResult};
use crate::registry::{Node, NodeAttr, NodeKind};
use async_trait::async_trait;

/// Filesystem-wide statistics for statfs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsStats {
    /// Total data blocks.
    pub blocks: u64,
    /// Free data blocks.
    pub blocks_free: u64,
    /// Total file slots.
    pub files: u64,
    /// Free file slots.
    pub files_free: u64,
    /// Preferred block size in bytes.
    pub block_size: u32,
}

/// A freshly created or looked-up object returned by the operation
/// table.
///
/// The dispatcher registers it, builds its cached path (in path mode),
/// and bumps its reference count exactly once.
pub struct NewNode<D> {
    /// Cookie the peer will address this object by.
    pub cookie: u64,
    /// Private data owned by the operation table.
    pub data: D,
    /// Initial attributes.
    pub attr: NodeAttr,
}

/// One directory entry produced by readdir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Cookie of the entry's object.
    pub cookie: u64,
    /// Object kind.
    pub kind: NodeKind,
    /// Entry name.
    pub name: Vec<u8>,
}

/// Attribute changes requested by setattr; `None` fields stay untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub mtime_secs: Option<u64>,
}

/// The callback set a concrete filesystem supplies.
#[async_trait]
pub trait FilesystemOps: Send + Sync + 'static {
    /// Private per-node data.
    type Data: Send + Sync + 'static;

    /// Provisions the root object when the mount starts.
    async fn init(&self) -> OpResult<NewNode<Self::Data>>;

    // -------------------------------------------------------------------------
    // Structural operations
    // -------------------------------------------------------------------------

    /// Tears down filesystem state ahead of unmount.
    async fn unmount(&self) -> OpResult<()> {
        Ok(())
    }

    /// Reports filesystem statistics.
    async fn statfs(&self) -> OpResult<FsStats> {
        Ok(FsStats::default())
    }

    /// Flushes dirty state to stable storage.
    async fn sync(&self) -> OpResult<()> {
        Ok(())
    }

    /// Translates an opaque file handle into a cookie.
    async fn handle_to_node(&self, _handle: &[u8]) -> OpResult<u64> {
        Err(Errno::NOSYS)
    }

    /// Translates a node into an opaque file handle.
    async fn node_to_handle(&self, _node: &Node<Self::Data>) -> OpResult<Vec<u8>> {
        Err(Errno::NOSYS)
    }

    /// Toggles extended-attribute support.
    async fn extattr_ctl(&self, _enable: bool) -> OpResult<()> {
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Per-object operations
    // -------------------------------------------------------------------------

    async fn lookup(
        &self,
        _parent: &Node<Self::Data>,
        _name: &[u8],
    ) -> OpResult<NewNode<Self::Data>> {
        Err(Errno::NOSYS)
    }

    async fn create(
        &self,
        _parent: &Node<Self::Data>,
        _name: &[u8],
        _mode: u32,
    ) -> OpResult<NewNode<Self::Data>> {
        Err(Errno::NOSYS)
    }

    async fn mknod(
        &self,
        _parent: &Node<Self::Data>,
        _name: &[u8],
        _mode: u32,
        _rdev: u32,
    ) -> OpResult<NewNode<Self::Data>> {
        Err(Errno::NOSYS)
    }

    async fn open(&self, _node: &Node<Self::Data>, _flags: u32) -> OpResult<()> {
        Err(Errno::NOSYS)
    }

    async fn close(&self, _node: &Node<Self::Data>, _flags: u32) -> OpResult<()> {
        Err(Errno::NOSYS)
    }

    async fn getattr(&self, _node: &Node<Self::Data>) -> OpResult<NodeAttr> {
        Err(Errno::NOSYS)
    }

    async fn setattr(&self, _node: &Node<Self::Data>, _set: &SetAttr) -> OpResult<NodeAttr> {
        Err(Errno::NOSYS)
    }

    async fn access(&self, _node: &Node<Self::Data>, _mask: u32) -> OpResult<()> {
        Err(Errno::NOSYS)
    }

    async fn read(&self, _node: &Node<Self::Data>, _offset: u64, _len: u32) -> OpResult<Vec<u8>> {
        Err(Errno::NOSYS)
    }

    async fn write(&self, _node: &Node<Self::Data>, _offset: u64, _data: &[u8]) -> OpResult<u32> {
        Err(Errno::NOSYS)
    }

    async fn fsync(&self, _node: &Node<Self::Data>, _datasync: bool) -> OpResult<()> {
        Err(Errno::NOSYS)
    }

    async fn link(
        &self,
        _parent: &Node<Self::Data>,
        _target: &Node<Self::Data>,
        _name: &[u8],
    ) -> OpResult<()> {
        Err(Errno::NOSYS)
    }

    async fn unlink(&self, _parent: &Node<Self::Data>, _name: &[u8]) -> OpResult<()> {
        Err(Errno::NOSYS)
    }

    async fn rename(
        &self,
        _from_parent: &Node<Self::Data>,
        _from_name: &[u8],
        _to_parent: &Node<Self::Data>,
        _to_name: &[u8],
    ) -> OpResult<()> {
        Err(Errno::NOSYS)
    }

    async fn mkdir(
        &self,
        _parent: &Node<Self::Data>,
        _name: &[u8],
        _mode: u32,
    ) -> OpResult<NewNode<Self::Data>> {
        Err(Errno::NOSYS)
    }

    async fn rmdir(&self, _parent: &Node<Self::Data>, _name: &[u8]) -> OpResult<()> {
        Err(Errno::NOSYS)
    }

    async fn symlink(
        &self,
        _parent: &Node<Self::Data>,
        _name: &[u8],
        _target: &[u8],
    ) -> OpResult<NewNode<Self::Data>> {
        Err(Errno::NOSYS)
    }

    async fn readlink(&self, _node: &Node<Self::Data>) -> OpResult<Vec<u8>> {
        Err(Errno::NOSYS)
    }

    async fn readdir(&self, _node: &Node<Self::Data>, _offset: u64) -> OpResult<Vec<DirEntry>> {
        Err(Errno::NOSYS)
    }

    async fn getxattr(&self, _node: &Node<Self::Data>, _name: &[u8]) -> OpResult<Vec<u8>> {
        Err(Errno::NOSYS)
    }

    async fn setxattr(
        &self,
        _node: &Node<Self::Data>,
        _name: &[u8],
        _value: &[u8],
    ) -> OpResult<()> {
        Err(Errno::NOSYS)
    }

    async fn listxattr(&self, _node: &Node<Self::Data>) -> OpResult<Vec<Vec<u8>>> {
        Err(Errno::NOSYS)
    }

    async fn removexattr(&self, _node: &Node<Self::Data>, _name: &[u8]) -> OpResult<()> {
        Err(Errno::NOSYS)
    }

    async fn fallocate(&self, _node: &Node<Self::Data>, _offset: u64, _len: u64) -> OpResult<()> {
        Err(Errno::NOSYS)
    }

    async fn fdiscard(&self, _node: &Node<Self::Data>, _offset: u64, _len: u64) -> OpResult<()> {
        Err(Errno::NOSYS)
    }

    /// The peer forgot this object; release bookkeeping for it.
    ///
    /// The dispatcher drops the registry entry afterwards regardless of
    /// the returned status.
    async fn reclaim(&self, _node: &Node<Self::Data>) -> OpResult<()> {
        Ok(())
    }
}
