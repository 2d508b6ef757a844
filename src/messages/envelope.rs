//! The tagged message envelope and its payload types.

use crate::core::{ModelParameters, Transition};
use crate::endpoints::Channel;
use crate::messages::LogPayload;
use serde::{Deserialize, Serialize};

/// Stable identity of an actor in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActorId {
    Coordinator,
    Learner,
    ReplayServer,
    Worker(u32),
    /// Evaluation-only worker; generates no training data.
    Tester,
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorId::Coordinator => write!(f, "coordinator"),
            ActorId::Learner => write!(f, "learner"),
            ActorId::ReplayServer => write!(f, "replay_server"),
            ActorId::Worker(n) => write!(f, "worker_{n}"),
            ActorId::Tester => write!(f, "tester"),
        }
    }
}

/// Which kind of data workers should generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataKind {
    /// Expert/demonstration transitions, used to seed the store.
    Demonstration,
    /// Regular agent-policy transitions.
    Agent,
}

/// A batch sampled from the prioritized store.
///
/// Indices are insertion stamps (monotone ids), not slot offsets: they
/// remain the join key for the later priority update even after the slot
/// has been overwritten by eviction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampledBatch {
    /// Sampled transitions, in draw order.
    pub transitions: Vec<Transition>,
    /// Insertion stamp of each transition.
    pub ids: Vec<u64>,
    /// Sampling probability of each transition at draw time.
    pub probabilities: Vec<f32>,
    /// Importance-sampling weights, normalized by the batch maximum.
    pub weights: Vec<f32>,
    /// SGD step this batch was sampled for.
    pub sgd_step: u64,
}

impl SampledBatch {
    /// Number of transitions in the batch.
    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    /// True when the batch holds no transitions.
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    /// Check that the parallel arrays agree in length.
    pub fn is_consistent(&self) -> bool {
        let n = self.transitions.len();
        self.ids.len() == n && self.probabilities.len() == n && self.weights.len() == n
    }
}

/// Every message that can travel on a pipeline channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    /// Bootstrap report: an actor announces the ports it has bound.
    Handshake {
        actor: ActorId,
        endpoints: Vec<(Channel, u16)>,
    },

    /// Per-step log packet aggregated by the coordinator.
    Log {
        sender: ActorId,
        step: u64,
        payload: LogPayload,
    },

    /// Worker -> replay server: a shipment of fresh transitions.
    ReplayData { transitions: Vec<Transition> },

    /// Replay server -> learner: one sampled batch.
    Batch(SampledBatch),

    /// Learner -> replay server: updated priorities keyed by insertion id.
    Priorities {
        ids: Vec<u64>,
        priorities: Vec<f32>,
        sgd_step: u64,
    },

    /// Learner -> workers broadcast: a parameter snapshot.
    Params(ModelParameters),

    /// Replay server -> workers broadcast: switch data generation mode.
    DataRequest { kind: DataKind },
}

impl Envelope {
    /// Short tag for diagnostics.
    pub fn tag(&self) -> &'static str {
        match self {
            Envelope::Handshake { .. } => "handshake",
            Envelope::Log { .. } => "log",
            Envelope::ReplayData { .. } => "replay_data",
            Envelope::Batch(_) => "batch",
            Envelope::Priorities { .. } => "priorities",
            Envelope::Params(_) => "params",
            Envelope::DataRequest { .. } => "data_request",
        }
    }
}
