//! Frame transport: size-delimited messages over channels, with partial
//! I/O resumption and reply correlation.

mod channel;
mod frame;

pub use channel::{
    Channel, ChannelHooks, ChannelId, CorrelationMatcher, ReplyMatcher, Transport,
};
pub use frame::{Frame, DEFAULT_MAX_FRAME_SIZE};
