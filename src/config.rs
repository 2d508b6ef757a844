//! Run configuration shared by every actor.
//!
//! A single `ApexConfig` is constructed by the process that starts the run
//! and handed (by value) to each spawned actor. Endpoint ports are NOT part
//! of this config; they are negotiated during bootstrap and persisted
//! separately (see [`crate::endpoints`]).

use crate::error::{ApexError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for a full distributed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApexConfig {
    /// Number of data-generating workers (excluding the tester).
    pub num_workers: u32,

    /// Replay store capacity (ring buffer size).
    pub replay_capacity: usize,

    /// Minimum stored entries before sampling is allowed.
    pub min_replay_size: usize,

    /// Priority exponent. 0 = uniform, 1 = fully prioritized.
    pub alpha: f32,

    /// Importance-sampling exponent, annealed toward 1.0 over training.
    pub beta: f32,

    /// Additive constant keeping priorities strictly positive.
    pub priority_epsilon: f32,

    /// Transitions per sampled batch.
    pub batch_size: usize,

    /// Maximum batches in flight from replay server to learner.
    pub max_pending_batches: usize,

    /// Demonstration transitions required before agent data collection
    /// starts. 0 disables the demonstration phase.
    pub n_demonstrations: usize,

    /// Worker-side buffer size; a replay packet ships when it fills.
    pub local_buffer_size: usize,

    /// Lowest port tried when binding sockets.
    pub min_port: u16,

    /// Number of ports above `min_port` to try.
    pub port_range: u16,

    /// Directory for endpoint map, pid files, and checkpoints.
    pub run_dir: PathBuf,

    /// SGD steps between replay store checkpoints.
    pub checkpoint_interval: u64,

    /// SGD steps between parameter broadcasts to workers.
    pub param_publish_interval: u64,

    /// Seconds to wait for each handshake report before aborting bootstrap.
    pub handshake_timeout_secs: u64,

    /// Unfinished-step backlog that triggers a forced flush.
    pub max_unfinished_steps: usize,

    /// SGD steps over which beta is annealed to 1.0.
    pub beta_anneal_steps: u64,

    /// Validation metric key used for best-performance tracking.
    pub objective_key: String,
}

impl Default for ApexConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            replay_capacity: 100_000,
            min_replay_size: 1_000,
            alpha: 0.6,
            beta: 0.4,
            priority_epsilon: 1e-6,
            batch_size: 128,
            max_pending_batches: 10,
            n_demonstrations: 0,
            local_buffer_size: 200,
            min_port: 10_000,
            port_range: 5_000,
            run_dir: PathBuf::from("./run"),
            checkpoint_interval: 1_000,
            param_publish_interval: 100,
            handshake_timeout_secs: 30,
            max_unfinished_steps: 50,
            beta_anneal_steps: 1_000_000,
            objective_key: "objective".to_string(),
        }
    }
}

impl ApexConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers.
    pub fn with_num_workers(mut self, n: u32) -> Self {
        self.num_workers = n;
        self
    }

    /// Set replay capacity.
    pub fn with_replay_capacity(mut self, capacity: usize) -> Self {
        self.replay_capacity = capacity;
        self
    }

    /// Set the minimum store size before sampling.
    pub fn with_min_replay_size(mut self, min_size: usize) -> Self {
        self.min_replay_size = min_size;
        self
    }

    /// Set priority and importance-sampling exponents.
    pub fn with_priority_exponents(mut self, alpha: f32, beta: f32) -> Self {
        self.alpha = alpha;
        self.beta = beta;
        self
    }

    /// Set the sampled batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the demonstration fill count (0 disables the phase).
    pub fn with_n_demonstrations(mut self, n: usize) -> Self {
        self.n_demonstrations = n;
        self
    }

    /// Set the port search window.
    pub fn with_port_window(mut self, min_port: u16, port_range: u16) -> Self {
        self.min_port = min_port;
        self.port_range = port_range;
        self
    }

    /// Set the run directory.
    pub fn with_run_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run_dir = dir.into();
        self
    }

    /// Set the handshake timeout.
    pub fn with_handshake_timeout_secs(mut self, secs: u64) -> Self {
        self.handshake_timeout_secs = secs;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(ApexError::Config("num_workers must be > 0".into()));
        }
        if self.replay_capacity == 0 {
            return Err(ApexError::Config("replay_capacity must be > 0".into()));
        }
        if self.min_replay_size == 0 || self.min_replay_size > self.replay_capacity {
            return Err(ApexError::Config(
                "min_replay_size must be in 1..=replay_capacity".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ApexError::Config("batch_size must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(ApexError::Config("alpha must be in [0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&self.beta) {
            return Err(ApexError::Config("beta must be in [0, 1]".into()));
        }
        if self.port_range == 0 {
            return Err(ApexError::Config("port_range must be > 0".into()));
        }
        if self.max_unfinished_steps == 0 {
            return Err(ApexError::Config("max_unfinished_steps must be > 0".into()));
        }
        Ok(())
    }

    /// Path of the persisted endpoint map.
    pub fn endpoints_path(&self) -> PathBuf {
        self.run_dir.join("endpoints.json")
    }

    /// Path of the coordinator run-state checkpoint.
    pub fn run_state_path(&self) -> PathBuf {
        self.run_dir.join("coordinator_state.json")
    }

    /// Path of the replay store checkpoint.
    pub fn replay_checkpoint_path(&self) -> PathBuf {
        self.run_dir.join("replay_store.bin")
    }

    /// Path of an actor's pid file.
    pub fn pid_path(&self, actor: &str) -> PathBuf {
        self.run_dir.join(format!("{actor}_pid.txt"))
    }

    /// Create the run directory if it does not exist.
    pub fn ensure_run_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.run_dir)?;
        Ok(())
    }

    /// True when a demonstration phase is configured.
    pub fn demonstrations_enabled(&self) -> bool {
        self.n_demonstrations > 0
    }

    /// Load a config from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| ApexError::Config(e.to_string()))
    }

    /// Save the config as JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| ApexError::Config(e.to_string()))?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}
