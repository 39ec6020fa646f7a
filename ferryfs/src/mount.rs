//! Mount assembly and the serve loop.
//!
//! A [`Mount`] ties the engine together: it bootstraps the root object
//! from the operation table, owns the registry, scheduler, and
//! transport for one mounted filesystem, and runs the serve loop that
//! feeds inbound requests to the dispatcher.
//!
//! Request handling is strictly serialized: the serve loop runs one
//! request context to completion before picking up the next frame, and
//! drains voluntarily yielded contexts between arrivals. Handlers are
//! free to await I/O; nothing else touches engine state while they do.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::dispatch::{DispatchHooks, Dispatcher, FilesystemOps};
use crate::error::EngineError;
use crate::registry::{CachedPath, CookieMap, Node, Registry};
use crate::error::SchedError;
use crate::sched::{Scheduler, YieldPoint};
use crate::transport::{ChannelHooks, CorrelationMatcher, ReplyMatcher, Transport};

// =============================================================================
// Lifecycle
// =============================================================================

/// Mount lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    /// Root bootstrap in progress.
    Mounting,
    /// Serving requests.
    Mounted,
    /// The unmount handler is running.
    Unmounting,
    /// Unmounted; serve loops exit.
    Dead,
}

/// Shared lifecycle cell consulted by the dispatcher and serve loop.
pub struct Lifecycle {
    state: Mutex<MountState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(MountState::Mounting),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> MountState {
        *self.state.lock()
    }

    pub(crate) fn set_mounted(&self) {
        *self.state.lock() = MountState::Mounted;
    }

    /// Enters the unmounting state; refused unless currently mounted.
    pub fn begin_unmount(&self) -> bool {
        let mut state = self.state.lock();
        if *state == MountState::Mounted {
            *state = MountState::Unmounting;
            true
        } else {
            false
        }
    }

    /// Commits a successful unmount.
    pub fn finish_unmount(&self) {
        *self.state.lock() = MountState::Dead;
        debug!("mount is dead");
    }

    /// Reverts a failed unmount back to the mounted state.
    pub fn abort_unmount(&self) {
        let mut state = self.state.lock();
        if *state == MountState::Unmounting {
            *state = MountState::Mounted;
        }
    }

    /// Returns whether the mount has been torn down.
    pub fn is_dead(&self) -> bool {
        self.state() == MountState::Dead
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Configures and assembles a [`Mount`].
pub struct MountBuilder<F: FilesystemOps> {
    ops: F,
    config: EngineConfig,
    dispatch_hooks: DispatchHooks,
    channel_hooks: ChannelHooks,
    cookie_map: Option<Arc<dyn CookieMap<F::Data>>>,
    matcher: Option<Arc<dyn ReplyMatcher>>,
}

impl<F: FilesystemOps> MountBuilder<F> {
    /// Sets the engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Installs dispatch observation hooks.
    pub fn dispatch_hooks(mut self, hooks: DispatchHooks) -> Self {
        self.dispatch_hooks = hooks;
        self
    }

    /// Installs channel lifecycle hooks.
    pub fn channel_hooks(mut self, hooks: ChannelHooks) -> Self {
        self.channel_hooks = hooks;
        self
    }

    /// Replaces the cookie-to-node mapping.
    pub fn cookie_map(mut self, map: Arc<dyn CookieMap<F::Data>>) -> Self {
        self.cookie_map = Some(map);
        self
    }

    /// Replaces the reply matcher.
    pub fn reply_matcher(mut self, matcher: Arc<dyn ReplyMatcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    /// Bootstraps the root object and assembles the mount.
    pub async fn build(self) -> Result<Mount<F>, EngineError> {
        self.config.validate()?;
        let ops = Arc::new(self.ops);
        let registry = Arc::new(Registry::new(self.config.path_mode));
        let lifecycle = Arc::new(Lifecycle::new());

        let root_new = ops
            .init()
            .await
            .map_err(|e| EngineError::Config(format!("filesystem init failed: {e}")))?;
        let root = registry.register(root_new.cookie, root_new.data, root_new.attr);
        if self.config.path_mode.enabled() {
            root.set_cached_path(CachedPath::new(b"/".to_vec(), self.config.path_mode));
        }
        root.ref_inc();

        let mut dispatcher = Dispatcher::new(ops.clone(), registry.clone())
            .with_hooks(self.dispatch_hooks)
            .with_max_frame_size(self.config.max_frame_size);
        if let Some(map) = self.cookie_map {
            dispatcher = dispatcher.with_cookie_map(map);
        }

        let matcher = self
            .matcher
            .unwrap_or_else(|| Arc::new(CorrelationMatcher));
        let transport = Transport::with_matcher(matcher, self.channel_hooks)
            .with_max_frame_size(self.config.max_frame_size);

        lifecycle.set_mounted();
        info!(root_cookie = root.cookie(), "mount ready");

        Ok(Mount {
            ops,
            registry,
            dispatcher: Arc::new(dispatcher),
            scheduler: Arc::new(Scheduler::with_pool_cap(self.config.context_pool_cap)),
            transport,
            lifecycle,
            root,
        })
    }
}

// =============================================================================
// Mount
// =============================================================================

/// One mounted filesystem: root object, registry, scheduler, transport.
pub struct Mount<F: FilesystemOps> {
    ops: Arc<F>,
    registry: Arc<Registry<F::Data>>,
    dispatcher: Arc<Dispatcher<F>>,
    scheduler: Arc<Scheduler>,
    transport: Transport,
    lifecycle: Arc<Lifecycle>,
    root: Arc<Node<F::Data>>,
}

impl<F: FilesystemOps> Mount<F> {
    /// Starts building a mount around an operation table.
    pub fn builder(ops: F) -> MountBuilder<F> {
        MountBuilder {
            ops,
            config: EngineConfig::default(),
            dispatch_hooks: DispatchHooks::default(),
            channel_hooks: ChannelHooks::default(),
            cookie_map: None,
            matcher: None,
        }
    }

    /// Builds a mount with defaults for everything but the configuration.
    pub async fn new(ops: F, config: EngineConfig) -> Result<Self, EngineError> {
        Mount::builder(ops).config(config).build().await
    }

    /// Returns the operation table.
    pub fn ops(&self) -> &Arc<F> {
        &self.ops
    }

    /// Returns the node registry.
    pub fn registry(&self) -> &Arc<Registry<F::Data>> {
        &self.registry
    }

    /// Returns the root node.
    pub fn root(&self) -> &Arc<Node<F::Data>> {
        &self.root
    }

    /// Returns the lifecycle cell.
    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Returns the transport.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Returns the context scheduler.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Serves requests from a peer stream until the peer goes away or
    /// the mount is unmounted.
    ///
    /// Each request runs in its own context, one at a time; failures are
    /// fatal to the request only.
    pub async fn serve<S>(&self, stream: S) -> Result<(), EngineError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (request_tx, mut request_rx) = mpsc::unbounded_channel();
        let channel = self.transport.add_channel(stream, request_tx);
        info!(channel = %channel.id(), "serving requests");

        while let Some(frame) = request_rx.recv().await {
            let dispatcher = self.dispatcher.clone();
            let lifecycle = self.lifecycle.clone();
            let req_channel = channel.clone();

            let mut handle = self.scheduler.create(move |mut ctx| async move {
                ctx.attach_frame(frame);
                let frame = match ctx.take_frame() {
                    Some(frame) => frame,
                    None => return ctx,
                };
                if let Err(e) = dispatcher.dispatch(&lifecycle, &req_channel, frame).await {
                    warn!(error = %e, "request failed");
                }
                ctx
            });
            loop {
                match handle.resume().await {
                    Ok(YieldPoint::Done) | Err(SchedError::Completed(_)) => break,
                    Ok(YieldPoint::Suspended) => continue,
                    Ok(YieldPoint::MainLoop) => {
                        // The context asked for the serve loop back; it
                        // waits on the run queue for the next drain.
                        self.scheduler.schedule(handle);
                        break;
                    }
                }
            }

            // Yielded continuations get a turn between arrivals.
            self.scheduler.drain().await?;

            if self.lifecycle.is_dead() {
                debug!("serve loop exiting after unmount");
                break;
            }
        }

        if let Err(e) = self.transport.remove(channel.id()) {
            debug!(error = %e, "channel already removed");
        }
        Ok(())
    }
}
