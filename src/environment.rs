//! External environment boundary.
//!
//! The combinatorial-optimization environment that actually produces
//! transitions lives outside this crate. Workers drive it through this
//! trait: tensors (encoded states) come out, scalars go back in. Test
//! suites substitute scripted stubs.

use crate::core::{ModelParameters, Transition};
use crate::messages::EvalRecord;

/// Data-generating environment consumed by workers.
pub trait Environment: Send {
    /// Run the environment for one episode fragment under the given
    /// policy parameters, returning the transitions generated.
    ///
    /// `epsilon` is the caller's exploration rate; implementations may
    /// ignore it. `demonstration` asks for expert-policy transitions.
    fn collect_step(
        &mut self,
        params: &ModelParameters,
        epsilon: f32,
        demonstration: bool,
    ) -> Vec<Transition>;

    /// Evaluate the given parameters on the validation instances,
    /// returning one record per (dataset, instance, seed) episode.
    fn evaluate(&mut self, params: &ModelParameters) -> Vec<EvalRecord>;
}

#[cfg(test)]
pub mod stub {
    //! Scripted environment used across the crate's tests.

    use super::*;

    /// Deterministic environment producing `per_step` transitions per call.
    pub struct StubEnvironment {
        pub per_step: usize,
        pub steps_taken: usize,
    }

    impl StubEnvironment {
        pub fn new(per_step: usize) -> Self {
            Self {
                per_step,
                steps_taken: 0,
            }
        }
    }

    impl Environment for StubEnvironment {
        fn collect_step(
            &mut self,
            params: &ModelParameters,
            _epsilon: f32,
            demonstration: bool,
        ) -> Vec<Transition> {
            self.steps_taken += 1;
            (0..self.per_step)
                .map(|i| {
                    let state = vec![self.steps_taken as f32, i as f32];
                    if demonstration {
                        Transition::demonstration(state, 0, 1.0, false)
                    } else {
                        Transition::new(state, 0, 1.0, false, params.version)
                    }
                })
                .collect()
        }

        fn evaluate(&mut self, params: &ModelParameters) -> Vec<EvalRecord> {
            vec![EvalRecord {
                dataset: "valid_stub".into(),
                instance: 0,
                seed: 0,
                metrics: vec![("objective".into(), params.version as f64)],
            }]
        }
    }
}
