//! Message transport: framed TCP push/pull queues and pub/sub broadcast.
//!
//! Layered over the [`crate::endpoints`] registry: binding ends allocate
//! their port from the configured window, connecting ends resolve the peer
//! through the endpoint map.

mod frame;
mod socket;

pub use frame::FramedStream;
pub use socket::{PubSocket, PullSocket, PushSocket, SubSocket};
