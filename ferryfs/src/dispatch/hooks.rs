//! Observation hooks around dispatch.
//!
//! Embedders install these to watch traffic without touching the
//! operation table: a pre-hook sees every request header before its
//! handler runs, a post-hook sees the header plus the reply status, and
//! the peer-error hook receives out-of-band error reports. All hooks
//! are synchronous and must not block.

use crate::wire::WireHeader;

/// Runs before an operation handler is invoked.
pub type PreOpHook = Box<dyn Fn(&WireHeader) + Send + Sync>;

/// Runs after an operation handler, with the reply status.
pub type PostOpHook = Box<dyn Fn(&WireHeader, i32) + Send + Sync>;

/// Receives out-of-band error reports from the peer: the reported
/// status and the raw payload after the header.
pub type PeerErrorHook = Box<dyn Fn(i32, &[u8]) + Send + Sync>;

/// Hook set installed on a dispatcher.
#[derive(Default)]
pub struct DispatchHooks {
    pub(crate) pre_op: Option<PreOpHook>,
    pub(crate) post_op: Option<PostOpHook>,
    pub(crate) peer_error: Option<PeerErrorHook>,
}

impl DispatchHooks {
    /// Creates an empty hook set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the pre-operation hook.
    pub fn on_pre_op<H>(mut self, hook: H) -> Self
    where
        H: Fn(&WireHeader) + Send + Sync + 'static,
    {
        self.pre_op = Some(Box::new(hook));
        self
    }

    /// Installs the post-operation hook.
    pub fn on_post_op<H>(mut self, hook: H) -> Self
    where
        H: Fn(&WireHeader, i32) + Send + Sync + 'static,
    {
        self.post_op = Some(Box::new(hook));
        self
    }

    /// Installs the peer-error hook.
    pub fn on_peer_error<H>(mut self, hook: H) -> Self
    where
        H: Fn(i32, &[u8]) + Send + Sync + 'static,
    {
        self.peer_error = Some(Box::new(hook));
        self
    }
}

impl std::fmt::Debug for DispatchHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchHooks")
            .field("pre_op", &self.pre_op.is_some())
            .field("post_op", &self.post_op.is_some())
            .field("peer_error", &self.peer_error.is_some())
            .finish()
    }
}
