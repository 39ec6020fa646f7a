//! Node and path registry: stable object identity, reference counts, and
//! optional cached absolute paths.

mod node;
mod path;
#[allow(clippy::module_inception)]
mod registry;

pub use node::{Node, NodeAttr, NodeId, NodeKind};
pub use path::{CachedPath, PathMode, PathTransform, SlashJoin};
pub use registry::{CookieMap, IdentityCookieMap, Registry};
