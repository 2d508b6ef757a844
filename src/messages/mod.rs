//! Wire messages exchanged between actors.
//!
//! Every packet on every channel is one [`Envelope`] variant with a fixed
//! schema, decoded by exhaustive match on the receiving side. Unknown or
//! out-of-place variants are dropped with a diagnostic, never a crash.
//!
//! ```text
//!   Workers ──ReplayData──> ReplayServer ──Batch──> Learner
//!      ^                        ^                      │
//!      │                        └────Priorities────────┤
//!      └──────────Params (broadcast)───────────────────┘
//!   all actors ──Log──> Coordinator
//! ```

mod envelope;
mod log_packet;

pub use envelope::{ActorId, DataKind, Envelope, SampledBatch};
pub use log_packet::{EvalRecord, LogPayload};
