//! # apex-rl: Distributed Ape-X Coordination
//!
//! Coordination and prioritized-replay pipeline for distributed
//! reinforcement learning in the Ape-X style: data-generating workers, a
//! central prioritized replay server, a two-loop learner, and a
//! coordinator that bootstraps endpoint discovery and aggregates per-step
//! logs. Model math and the environment are external collaborators behind
//! trait boundaries.
//!
//! ## Architecture Overview
//!
//! ```text
//!                      ┌─────────────────┐
//!                      │   Coordinator   │◄─────── log packets ──────┐
//!                      │  (rendezvous +  │                           │
//!                      │   aggregation)  │                           │
//!                      └────────┬────────┘                           │
//!                   handshakes  │  spawns (via Launcher)             │
//!          ┌────────────────────┼──────────────────┐                 │
//!          ▼                    ▼                  ▼                 │
//!    ┌──────────┐ transitions ┌──────────────┐ batches ┌─────────┐  │
//!    │ Worker N │────────────>│ ReplayServer │────────>│ Learner │──┘
//!    │ (env)    │             │ (prioritized │<────────│ io+opt  │
//!    └────┬─────┘             │    store)    │ priors  └────┬────┘
//!         ▲                   └──────────────┘              │
//!         └──────────────── params broadcast ───────────────┘
//! ```
//!
//! ## Bootstrap
//!
//! Processes start independently and discover each other through a
//! sequential handshake: the coordinator binds its rendezvous port, each
//! spawned actor binds its own ports and reports them back, and the full
//! endpoint map is persisted so single-actor restarts skip renegotiation.
//! Every wait is bounded; a missing report aborts the run.
//!
//! ## Delivery model
//!
//! All channels are at-most-once. Lost transitions are regenerated, lost
//! priorities are resampled, lost parameter broadcasts are superseded by
//! the next publish. Only the bootstrap handshake demands delivery, and
//! it fails loudly instead of retrying.

pub mod config;
pub mod coordinator;
pub mod core;
pub mod endpoints;
pub mod environment;
pub mod error;
pub mod learner;
pub mod messages;
pub mod metrics;
pub mod replay;
pub mod transport;
pub mod worker;

pub use config::ApexConfig;
pub use coordinator::{Coordinator, Launcher, RunState, StepAggregator};
pub use core::{ModelParameters, Transition};
pub use endpoints::{Channel, EndpointMap};
pub use environment::Environment;
pub use error::{ApexError, Result};
pub use learner::{Learner, OptimizeOutcome, Optimizer};
pub use messages::{ActorId, DataKind, Envelope, SampledBatch};
pub use replay::{LocalBuffer, PrioritizedReplay, ReplayConfig, ReplayServer};
pub use worker::Worker;
