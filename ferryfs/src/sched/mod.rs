//! Call-context scheduler: suspendable, resumable request contexts with
//! pooled bookkeeping and a FIFO run queue.

mod context;
mod pool;
mod scheduler;

pub use context::{Context, ContextFlags, ContextHandle, ContextId, YieldPoint};
pub use pool::{ContextPool, ContextRecord, DEFAULT_CONTEXT_POOL_CAP};
pub use scheduler::Scheduler;
