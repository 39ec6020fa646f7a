//! The live-node registry.
//!
//! Gives filesystem objects stable identity (same cookie, same node) and
//! maintains the optional cached absolute paths. The cookie-to-node
//! mapping is pluggable via [`CookieMap`]; the default resolves a cookie
//! to the node registered under exactly that value.

use crate::error::RegistryError;
use crate::registry::node::{Node, NodeAttr, NodeId};
use crate::registry::path::{CachedPath, PathMode, PathTransform, SlashJoin};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Resolves peer-supplied cookies to live nodes.
///
/// The peer deals in opaque handles; an embedder whose cookies are not
/// node-unique (hard links, alias handles) supplies its own mapping.
pub trait CookieMap<D>: Send + Sync {
    /// Resolves a cookie to a node, or `None` if no live node matches.
    fn resolve(&self, registry: &Registry<D>, cookie: u64) -> Option<Arc<Node<D>>>;
}

/// Default mapping: a cookie resolves to the node registered under that
/// exact value.
pub struct IdentityCookieMap;

impl<D: Send + Sync> CookieMap<D> for IdentityCookieMap {
    fn resolve(&self, registry: &Registry<D>, cookie: u64) -> Option<Arc<Node<D>>> {
        registry.find_by_cookie(cookie)
    }
}

/// Registry of live filesystem objects for one mount.
pub struct Registry<D> {
    next_id: AtomicU64,
    /// Live nodes in registration order; `walk` traverses this.
    live: Mutex<Vec<Arc<Node<D>>>>,
    /// Released nodes still carrying references, kept for late releasers.
    removed: Mutex<Vec<Arc<Node<D>>>>,
    /// Cookie index for the identity mapping.
    index: DashMap<u64, Arc<Node<D>>>,
    mode: PathMode,
    transform: Box<dyn PathTransform>,
}

impl<D: Send + Sync> Registry<D> {
    /// Creates a registry with the default slash-join path transform.
    pub fn new(mode: PathMode) -> Self {
        Self::with_transform(mode, Box::new(SlashJoin))
    }

    /// Creates a registry with a custom path transform.
    pub fn with_transform(mode: PathMode, transform: Box<dyn PathTransform>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            live: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            index: DashMap::new(),
            mode,
            transform,
        }
    }

    /// Returns the mount's path caching mode.
    pub fn path_mode(&self) -> PathMode {
        self.mode
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Registers a new node under a cookie and inserts it into the live
    /// list.
    ///
    /// Registering a cookie that is already live returns the existing
    /// node instead; identity is stable for the registry's lifetime.
    pub fn register(&self, cookie: u64, data: D, attr: NodeAttr) -> Arc<Node<D>> {
        if let Some(existing) = self.index.get(&cookie) {
            trace!(cookie, node = %existing.id(), "cookie already registered");
            return existing.clone();
        }
        let id = NodeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let node = Arc::new(Node::new(id, cookie, data, attr));
        self.live.lock().push(node.clone());
        self.index.insert(cookie, node.clone());
        debug!(node = %id, cookie, "node registered");
        node
    }

    /// Removes a node from the live list.
    ///
    /// A node still carrying references moves to the removed list so late
    /// releasers can find it; it is dropped once the last reference goes.
    pub fn release(&self, node: &Arc<Node<D>>) -> Result<(), RegistryError> {
        let mut live = self.live.lock();
        let pos = live
            .iter()
            .position(|n| n.id() == node.id())
            .ok_or(RegistryError::NotRegistered(node.id().0))?;
        live.remove(pos);
        drop(live);

        self.index.remove(&node.cookie());
        if node.refs() > 0 {
            debug!(node = %node.id(), refs = node.refs(), "released with live references");
            self.removed.lock().push(node.clone());
        } else {
            node.clear_cached_path();
        }
        Ok(())
    }

    /// Drops one reference; purges the node if it was already released
    /// and this was the last reference.
    pub fn unref(&self, node: &Arc<Node<D>>) {
        if node.ref_dec() == 0 {
            let mut removed = self.removed.lock();
            if let Some(pos) = removed.iter().position(|n| n.id() == node.id()) {
                let gone = removed.remove(pos);
                gone.clear_cached_path();
                trace!(node = %gone.id(), "removed node fully unreferenced");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    /// Resolves a cookie through the identity index.
    pub fn find_by_cookie(&self, cookie: u64) -> Option<Arc<Node<D>>> {
        self.index.get(&cookie).map(|entry| entry.clone())
    }

    /// Linear traversal of the live list with early exit.
    pub fn walk<P>(&self, mut predicate: P) -> Option<Arc<Node<D>>>
    where
        P: FnMut(&Arc<Node<D>>) -> bool,
    {
        self.live.lock().iter().find(|n| predicate(n)).cloned()
    }

    /// Finds the live node whose cached path matches `path` exactly.
    pub fn find_by_path(&self, path: &[u8]) -> Option<Arc<Node<D>>> {
        self.walk(|n| {
            n.cached_path()
                .map(|p| p.matches(path))
                .unwrap_or(false)
        })
    }

    /// Returns the number of live nodes.
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Returns the number of released-but-referenced nodes.
    pub fn removed_count(&self) -> usize {
        self.removed.lock().len()
    }

    // -------------------------------------------------------------------------
    // Paths
    // -------------------------------------------------------------------------

    /// Composes a child path from a parent's cached path and a component,
    /// through the transform hook.
    pub fn path_build(
        &self,
        parent: &Arc<Node<D>>,
        component: &[u8],
    ) -> Result<CachedPath, RegistryError> {
        if !self.mode.enabled() {
            return Err(RegistryError::PathModeOff);
        }
        let parent_path = parent
            .cached_path()
            .ok_or(RegistryError::NoPath(parent.id().0))?;
        let bytes = self.transform.build(parent_path.as_bytes(), component);
        Ok(CachedPath::new(bytes, self.mode))
    }

    /// Rewrites the cached path of every live node that is a strict
    /// descendant of `old_prefix`, replacing the prefix with `new_prefix`.
    ///
    /// All-or-nothing: every replacement path is staged before any node
    /// is touched, and the commit happens under the live-list lock, so a
    /// concurrent walk never observes a mix of old and new prefixes.
    /// Returns the number of rewritten paths.
    pub fn path_prefix_rewrite(&self, old_prefix: &[u8], new_prefix: &[u8]) -> usize {
        if !self.mode.enabled() {
            return 0;
        }
        let live = self.live.lock();
        let staged: Vec<(&Arc<Node<D>>, CachedPath)> = live
            .iter()
            .filter_map(|node| {
                let path = node.cached_path()?;
                path.is_strict_descendant_of(old_prefix)
                    .then(|| (node, path.rebased(old_prefix, new_prefix, self.mode)))
            })
            .collect();

        let count = staged.len();
        for (node, path) in staged {
            node.set_cached_path(path);
        }
        debug!(
            rewritten = count,
            old = %String::from_utf8_lossy(old_prefix),
            new = %String::from_utf8_lossy(new_prefix),
            "prefix rewrite committed"
        );
        count
    }
}

impl<D> std::fmt::Debug for Registry<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("live", &self.live.lock().len())
            .field("removed", &self.removed.lock().len())
            .field("mode", &self.mode)
            .finish()
    }
}
