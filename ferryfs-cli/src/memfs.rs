//! An in-memory filesystem served by the demo daemon.
//!
//! Everything lives in one table keyed by cookie; the root is cookie 1.
//! State vanishes when the daemon exits.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use ferryfs::{
    DirEntry, Errno, FilesystemOps, FsStats, NewNode, Node, NodeAttr, NodeKind, OpResult, SetAttr,
};

/// Cookie of the root directory.
pub const ROOT_COOKIE: u64 = 1;

struct Entry {
    parent: u64,
    name: Vec<u8>,
    kind: NodeKind,
    mode: u32,
    content: Vec<u8>,
    mtime_secs: u64,
}

/// The demo filesystem.
pub struct MemFs {
    entries: Mutex<HashMap<u64, Entry>>,
    next_cookie: AtomicU64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl MemFs {
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            ROOT_COOKIE,
            Entry {
                parent: ROOT_COOKIE,
                name: b"/".to_vec(),
                kind: NodeKind::Dir,
                mode: 0o755,
                content: Vec::new(),
                mtime_secs: now_secs(),
            },
        );
        Self {
            entries: Mutex::new(entries),
            next_cookie: AtomicU64::new(ROOT_COOKIE + 1),
        }
    }

    fn attr_of(&self, cookie: u64) -> Option<NodeAttr> {
        let entries = self.entries.lock();
        let entry = entries.get(&cookie)?;
        Some(NodeAttr {
            kind: entry.kind,
            mode: entry.mode,
            nlink: if entry.kind == NodeKind::Dir { 2 } else { 1 },
            uid: 0,
            gid: 0,
            size: entry.content.len() as u64,
            mtime_secs: entry.mtime_secs,
        })
    }

    fn child_of(&self, parent: u64, name: &[u8]) -> Option<u64> {
        self.entries
            .lock()
            .iter()
            .find(|(cookie, e)| e.parent == parent && e.name == name && **cookie != parent)
            .map(|(cookie, _)| *cookie)
    }

    fn has_children(&self, parent: u64) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|(cookie, e)| e.parent == parent && *cookie != parent)
    }

    fn insert(&self, parent: u64, name: &[u8], kind: NodeKind, mode: u32) -> u64 {
        let cookie = self.next_cookie.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(
            cookie,
            Entry {
                parent,
                name: name.to_vec(),
                kind,
                mode,
                content: Vec::new(),
                mtime_secs: now_secs(),
            },
        );
        cookie
    }

    fn new_node(&self, cookie: u64) -> OpResult<NewNode<u64>> {
        Ok(NewNode {
            cookie,
            data: cookie,
            attr: self.attr_of(cookie).ok_or(Errno::NOENT)?,
        })
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FilesystemOps for MemFs {
    type Data = u64;

    async fn init(&self) -> OpResult<NewNode<u64>> {
        self.new_node(ROOT_COOKIE)
    }

    async fn statfs(&self) -> OpResult<FsStats> {
        let files = self.entries.lock().len() as u64;
        Ok(FsStats {
            blocks: 0,
            blocks_free: 0,
            files,
            files_free: u64::MAX - files,
            block_size: 4096,
        })
    }

    async fn lookup(&self, parent: &Node<u64>, name: &[u8]) -> OpResult<NewNode<u64>> {
        let cookie = self.child_of(parent.cookie(), name).ok_or(Errno::NOENT)?;
        self.new_node(cookie)
    }

    async fn create(&self, parent: &Node<u64>, name: &[u8], mode: u32) -> OpResult<NewNode<u64>> {
        if self.child_of(parent.cookie(), name).is_some() {
            return Err(Errno::INVAL);
        }
        let cookie = self.insert(parent.cookie(), name, NodeKind::File, mode);
        self.new_node(cookie)
    }

    async fn mkdir(&self, parent: &Node<u64>, name: &[u8], mode: u32) -> OpResult<NewNode<u64>> {
        if self.child_of(parent.cookie(), name).is_some() {
            return Err(Errno::INVAL);
        }
        let cookie = self.insert(parent.cookie(), name, NodeKind::Dir, mode);
        self.new_node(cookie)
    }

    async fn getattr(&self, node: &Node<u64>) -> OpResult<NodeAttr> {
        self.attr_of(*node.data()).ok_or(Errno::NOENT)
    }

    async fn setattr(&self, node: &Node<u64>, set: &SetAttr) -> OpResult<NodeAttr> {
        {
            let mut entries = self.entries.lock();
            let entry = entries.get_mut(node.data()).ok_or(Errno::NOENT)?;
            if let Some(mode) = set.mode {
                entry.mode = mode;
            }
            if let Some(size) = set.size {
                entry.content.resize(size as usize, 0);
            }
            if let Some(mtime) = set.mtime_secs {
                entry.mtime_secs = mtime;
            }
        }
        self.attr_of(*node.data()).ok_or(Errno::NOENT)
    }

    async fn open(&self, _node: &Node<u64>, _flags: u32) -> OpResult<()> {
        Ok(())
    }

    async fn close(&self, _node: &Node<u64>, _flags: u32) -> OpResult<()> {
        Ok(())
    }

    async fn read(&self, node: &Node<u64>, offset: u64, len: u32) -> OpResult<Vec<u8>> {
        let entries = self.entries.lock();
        let entry = entries.get(node.data()).ok_or(Errno::NOENT)?;
        let start = (offset as usize).min(entry.content.len());
        let end = (start + len as usize).min(entry.content.len());
        Ok(entry.content[start..end].to_vec())
    }

    async fn write(&self, node: &Node<u64>, offset: u64, data: &[u8]) -> OpResult<u32> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(node.data()).ok_or(Errno::NOENT)?;
        let end = offset as usize + data.len();
        if entry.content.len() < end {
            entry.content.resize(end, 0);
        }
        entry.content[offset as usize..end].copy_from_slice(data);
        entry.mtime_secs = now_secs();
        Ok(data.len() as u32)
    }

    async fn readdir(&self, node: &Node<u64>, offset: u64) -> OpResult<Vec<DirEntry>> {
        let entries = self.entries.lock();
        let mut listing: Vec<DirEntry> = entries
            .iter()
            .filter(|(cookie, e)| e.parent == node.cookie() && **cookie != node.cookie())
            .map(|(cookie, e)| DirEntry {
                cookie: *cookie,
                kind: e.kind,
                name: e.name.clone(),
            })
            .collect();
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing.into_iter().skip(offset as usize).collect())
    }

    async fn rename(
        &self,
        from_parent: &Node<u64>,
        from_name: &[u8],
        to_parent: &Node<u64>,
        to_name: &[u8],
    ) -> OpResult<()> {
        let cookie = self
            .child_of(from_parent.cookie(), from_name)
            .ok_or(Errno::NOENT)?;
        if let Some(existing) = self.child_of(to_parent.cookie(), to_name) {
            if existing != cookie {
                return Err(Errno::INVAL);
            }
        }
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&cookie).ok_or(Errno::NOENT)?;
        entry.parent = to_parent.cookie();
        entry.name = to_name.to_vec();
        Ok(())
    }

    async fn unlink(&self, parent: &Node<u64>, name: &[u8]) -> OpResult<()> {
        let cookie = self.child_of(parent.cookie(), name).ok_or(Errno::NOENT)?;
        let mut entries = self.entries.lock();
        if entries.get(&cookie).map(|e| e.kind) == Some(NodeKind::Dir) {
            return Err(Errno::INVAL);
        }
        entries.remove(&cookie);
        Ok(())
    }

    async fn rmdir(&self, parent: &Node<u64>, name: &[u8]) -> OpResult<()> {
        let cookie = self.child_of(parent.cookie(), name).ok_or(Errno::NOENT)?;
        if self.has_children(cookie) {
            return Err(Errno::NOTEMPTY);
        }
        self.entries.lock().remove(&cookie);
        Ok(())
    }
}
