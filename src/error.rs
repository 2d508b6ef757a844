//! Error taxonomy for the distributed training pipeline.
//!
//! Failures fall into two classes: fatal setup errors (port exhaustion,
//! bootstrap timeouts, missing endpoint files) that abort the run, and
//! recoverable runtime conditions (insufficient replay data, lost messages)
//! that the calling loop handles and keeps cycling through.

use std::io;
use thiserror::Error;

/// Errors produced by the coordination and replay pipeline.
#[derive(Debug, Error)]
pub enum ApexError {
    /// No free port could be bound inside the configured range.
    #[error("no free port in range {min_port}..{max_port}")]
    PortExhaustion { min_port: u16, max_port: u16 },

    /// Sampling was requested before the store reached its minimum size.
    #[error("replay store has {len} entries, minimum for sampling is {min_size}")]
    InsufficientData { len: usize, min_size: usize },

    /// A required actor did not report its endpoints within the handshake window.
    #[error("bootstrap timeout waiting for {actor} after {waited_secs:.1}s")]
    BootstrapTimeout { actor: String, waited_secs: f64 },

    /// Restart was requested but no persisted endpoint map exists.
    #[error("no endpoint map found at {path}; run without --restart to negotiate fresh ports")]
    EndpointsMissing { path: String },

    /// An actor targeted for respawn is still alive and `force` was not set.
    #[error("{actor} is still running (pid {pid}); use force to kill it before respawning")]
    ActorAlive { actor: String, pid: i32 },

    /// Socket-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Wire encode/decode failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// An inbound packet had a shape the receiver cannot accept.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// Checkpoint write failure. Load failures are handled locally by
    /// falling back to a fresh state and are not surfaced through here.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Config(String),
}

impl From<bincode::Error> for ApexError {
    fn from(e: bincode::Error) -> Self {
        ApexError::Codec(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ApexError>;
