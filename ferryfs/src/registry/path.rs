//! Cached absolute paths and path composition.
//!
//! Path caching is a per-mount toggle, not a property of every node:
//! [`PathMode::Off`] skips all of this machinery, [`PathMode::Cached`]
//! maintains plain byte paths, and [`PathMode::CachedHashed`] additionally
//! precomputes a hash so lookups by path avoid byte comparison in the
//! common case.

use std::hash::{Hash, Hasher};

/// Per-mount path caching policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathMode {
    /// No cached paths; rename rewriting is a no-op.
    Off,
    /// Cache absolute paths on lookup/create.
    #[default]
    Cached,
    /// Cache paths and precompute a hash for each.
    CachedHashed,
}

impl PathMode {
    /// Returns whether path caching is enabled at all.
    pub fn enabled(self) -> bool {
        !matches!(self, PathMode::Off)
    }

    /// Returns whether cached paths carry a precomputed hash.
    pub fn hashed(self) -> bool {
        matches!(self, PathMode::CachedHashed)
    }
}

/// An absolute path cached on a node: bytes plus an optional precomputed
/// hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPath {
    bytes: Vec<u8>,
    hash: Option<u64>,
}

impl CachedPath {
    /// Builds a cached path, hashing it if the mode asks for hashes.
    pub fn new(bytes: Vec<u8>, mode: PathMode) -> Self {
        let hash = mode.hashed().then(|| hash_bytes(&bytes));
        Self { bytes, hash }
    }

    /// Returns the path bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the path length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true for the empty path.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns the precomputed hash, if hashing was enabled.
    pub fn hash(&self) -> Option<u64> {
        self.hash
    }

    /// Compares against raw path bytes, using the hash as a fast reject
    /// when one is present.
    pub fn matches(&self, other: &[u8]) -> bool {
        if let Some(h) = self.hash {
            if h != hash_bytes(other) {
                return false;
            }
        }
        self.bytes == other
    }

    /// Returns whether this path is a strict descendant of `prefix`.
    ///
    /// `/a/b/d` is a strict descendant of `/a/b`; `/a/b` itself and
    /// `/a/bd` are not. A prefix of `/` treats every longer path as a
    /// descendant.
    pub fn is_strict_descendant_of(&self, prefix: &[u8]) -> bool {
        if self.bytes.len() <= prefix.len() || !self.bytes.starts_with(prefix) {
            return false;
        }
        prefix.ends_with(b"/") || self.bytes[prefix.len()] == b'/'
    }

    /// Returns this path with `old_prefix` replaced by `new_prefix`.
    ///
    /// Only valid for strict descendants of `old_prefix`; the caller
    /// checks that first.
    pub fn rebased(&self, old_prefix: &[u8], new_prefix: &[u8], mode: PathMode) -> CachedPath {
        let mut bytes = Vec::with_capacity(new_prefix.len() + self.bytes.len() - old_prefix.len());
        bytes.extend_from_slice(new_prefix);
        bytes.extend_from_slice(&self.bytes[old_prefix.len()..]);
        CachedPath::new(bytes, mode)
    }
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Pluggable path composition hook.
///
/// The registry calls this to build a child path from a parent's cached
/// path and a name, letting embedders normalize names (case folding,
/// encoding fixes) before the path is cached.
pub trait PathTransform: Send + Sync {
    /// Composes a child path from a parent path and a component name.
    fn build(&self, parent: &[u8], component: &[u8]) -> Vec<u8>;
}

/// Default transform: join with `/`, collapsing a trailing slash on the
/// parent.
pub struct SlashJoin;

impl PathTransform for SlashJoin {
    fn build(&self, parent: &[u8], component: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(parent.len() + 1 + component.len());
        out.extend_from_slice(parent);
        if !out.ends_with(b"/") {
            out.push(b'/');
        }
        out.extend_from_slice(component);
        out
    }
}
