//! External optimizer boundary.
//!
//! Gradient computation is outside this crate. The learner feeds sampled
//! batches through this trait and gets back per-sample priorities (TD
//! error magnitudes) plus loss statistics for logging.

use crate::messages::SampledBatch;

/// Result of one optimization step.
#[derive(Debug, Clone)]
pub struct OptimizeOutcome {
    /// New priority per batch sample, aligned with `batch.ids`.
    pub priorities: Vec<f32>,
    /// Scalar loss statistics for the coordinator's log.
    pub stats: Vec<(String, f64)>,
}

/// One SGD step over a sampled batch.
pub trait Optimizer: Send {
    /// Perform one training step and return new priorities and stats.
    fn optimize(&mut self, batch: &SampledBatch) -> OptimizeOutcome;

    /// Snapshot the current policy parameters as a flat vector.
    fn export_params(&self) -> Vec<f32>;
}

#[cfg(test)]
pub mod stub {
    //! Deterministic optimizer used across the crate's tests.

    use super::*;

    /// Returns each sample's reward magnitude as its new priority.
    pub struct StubOptimizer {
        pub steps: u64,
    }

    impl StubOptimizer {
        pub fn new() -> Self {
            Self { steps: 0 }
        }
    }

    impl Optimizer for StubOptimizer {
        fn optimize(&mut self, batch: &SampledBatch) -> OptimizeOutcome {
            self.steps += 1;
            OptimizeOutcome {
                priorities: batch
                    .transitions
                    .iter()
                    .map(|t| t.reward.abs() + 0.1)
                    .collect(),
                stats: vec![("loss".into(), 1.0 / self.steps as f64)],
            }
        }

        fn export_params(&self) -> Vec<f32> {
            vec![self.steps as f32]
        }
    }
}
