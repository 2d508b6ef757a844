//! Log packet payloads aggregated by the coordinator.

use serde::{Deserialize, Serialize};

/// One evaluation episode result from a tester worker.
///
/// Keyed by `(dataset, instance, seed)` so the coordinator can average
/// across seeds and instances when a step finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalRecord {
    /// Validation dataset name.
    pub dataset: String,
    /// Instance index within the dataset.
    pub instance: u32,
    /// Environment seed.
    pub seed: u64,
    /// Scalar metrics for this episode.
    pub metrics: Vec<(String, f64)>,
}

impl EvalRecord {
    /// Look up a metric by key.
    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics
            .iter()
            .find(|(k, _)| k == key)
            .map(|&(_, v)| v)
    }
}

/// Actor-specific contents of a log packet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogPayload {
    /// Training-time scalars, averaged per step across senders.
    pub training: Vec<(String, f64)>,
    /// Evaluation results, averaged across (instance, seed) on flush.
    pub validation: Vec<EvalRecord>,
}

impl LogPayload {
    /// Payload with only training scalars.
    pub fn training(stats: Vec<(String, f64)>) -> Self {
        Self {
            training: stats,
            validation: Vec::new(),
        }
    }

    /// Payload with only evaluation records.
    pub fn validation(records: Vec<EvalRecord>) -> Self {
        Self {
            training: Vec::new(),
            validation: records,
        }
    }

    /// True when the payload carries nothing.
    pub fn is_empty(&self) -> bool {
        self.training.is_empty() && self.validation.is_empty()
    }
}
