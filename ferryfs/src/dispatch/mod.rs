//! Opcode dispatch over a pluggable operation table.

mod dispatcher;
mod hooks;
mod ops;

pub use dispatcher::Dispatcher;
pub use hooks::{DispatchHooks, PeerErrorHook, PostOpHook, PreOpHook};
pub use ops::{DirEntry, FilesystemOps, FsStats, NewNode, SetAttr};
