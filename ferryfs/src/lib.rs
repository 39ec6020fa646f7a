//! FerryFS - userspace filesystem execution engine
//!
//! This library carries filesystem requests between a peer and an
//! embedder-supplied operation table: framed messages over async
//! channels, suspendable request contexts, a live-node registry with
//! optional cached paths, and an opcode dispatcher.
//!
//! A minimal embedding builds a [`Mount`] around a [`FilesystemOps`]
//! implementation and serves a connected stream:
//!
//! ```no_run
//! # use ferryfs::{EngineConfig, Mount, FilesystemOps, NewNode, OpResult, NodeAttr};
//! # use async_trait::async_trait;
//! # struct MyFs;
//! # #[async_trait]
//! # impl FilesystemOps for MyFs {
//! #     type Data = ();
//! #     async fn init(&self) -> OpResult<NewNode<()>> {
//! #         Ok(NewNode { cookie: 1, data: (), attr: NodeAttr::default() })
//! #     }
//! # }
//! # async fn run(stream: tokio::net::UnixStream) -> Result<(), Box<dyn std::error::Error>> {
//! let mount = Mount::new(MyFs, EngineConfig::default()).await?;
//! mount.serve(stream).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod mount;
pub mod registry;
pub mod sched;
pub mod transport;
pub mod wire;

pub use config::EngineConfig;
pub use dispatch::{DirEntry, DispatchHooks, Dispatcher, FilesystemOps, FsStats, NewNode, SetAttr};
pub use error::{EngineError, Errno, OpResult};
pub use mount::{Lifecycle, Mount, MountBuilder, MountState};
pub use registry::{
    CachedPath, CookieMap, IdentityCookieMap, Node, NodeAttr, NodeId, NodeKind, PathMode, Registry,
};
pub use sched::{Context, ContextHandle, Scheduler};
pub use transport::{Channel, ChannelHooks, ChannelId, Frame, ReplyMatcher, Transport};
