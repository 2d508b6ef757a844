//! Learner actor: consumes batches, returns priorities, broadcasts
//! parameters.

#[allow(clippy::module_inception)]
mod learner;
pub mod optimizer;

#[cfg(test)]
mod tests;

pub use learner::{Learner, LearnerCore, LearnerIo};
pub use optimizer::{OptimizeOutcome, Optimizer};
