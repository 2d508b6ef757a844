//! Experience records shipped from workers to the replay store.
//!
//! A transition is immutable once stored; only its priority (held by the
//! store, not here) changes afterwards. The policy version stamp records
//! which broadcast parameters produced the action, so staleness can be
//! diagnosed downstream.

use serde::{Deserialize, Serialize};

/// One step of experience produced by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// Encoded state observation.
    pub state: Vec<f32>,
    /// Discrete action selected.
    pub action: u32,
    /// Reward received.
    pub reward: f32,
    /// Episode ended at this step.
    pub terminal: bool,
    /// Version of the policy parameters that selected the action.
    pub policy_version: u64,
    /// Generated by the demonstration policy rather than the agent.
    pub is_demonstration: bool,
}

impl Transition {
    /// Create an agent-generated transition.
    pub fn new(
        state: Vec<f32>,
        action: u32,
        reward: f32,
        terminal: bool,
        policy_version: u64,
    ) -> Self {
        Self {
            state,
            action,
            reward,
            terminal,
            policy_version,
            is_demonstration: false,
        }
    }

    /// Create a demonstration transition (version 0, expert policy).
    pub fn demonstration(state: Vec<f32>, action: u32, reward: f32, terminal: bool) -> Self {
        Self {
            state,
            action,
            reward,
            terminal,
            policy_version: 0,
            is_demonstration: true,
        }
    }

    /// How many versions behind `current` this transition was generated.
    pub fn version_lag(&self, current: u64) -> u64 {
        current.saturating_sub(self.policy_version)
    }
}
