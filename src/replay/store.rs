//! The central prioritized replay store.
//!
//! Ring-buffer storage with priority-proportional sampling and
//! importance-sampling weight correction. Owned and mutated by a single
//! process (the replay server); workers and the learner reach it only
//! through messages.
//!
//! Entries are addressed externally by their insertion stamp, a monotone
//! id assigned at insert time. The slot for stamp `id` is always
//! `id % capacity`, so an update for an evicted entry is detected exactly:
//! the stamp stored in the slot no longer matches.

use crate::config::ApexConfig;
use crate::core::Transition;
use crate::error::{ApexError, Result};
use crate::messages::SampledBatch;
use crate::replay::sum_tree::SumTree;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Replay store tuning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Ring buffer capacity.
    pub capacity: usize,
    /// Minimum entries before sampling is allowed.
    pub min_size: usize,
    /// Priority exponent.
    pub alpha: f32,
    /// Initial importance-sampling exponent.
    pub beta: f32,
    /// Additive constant keeping priorities strictly positive.
    pub priority_epsilon: f32,
    /// Demonstration transitions required before agent data. 0 disables.
    pub n_demonstrations: usize,
    /// SGD steps over which beta anneals to 1.0.
    pub beta_anneal_steps: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            min_size: 1_000,
            alpha: 0.6,
            beta: 0.4,
            priority_epsilon: 1e-6,
            n_demonstrations: 0,
            beta_anneal_steps: 1_000_000,
        }
    }
}

impl ReplayConfig {
    /// Extract the replay parameters from the run config.
    pub fn from_apex(config: &ApexConfig) -> Self {
        Self {
            capacity: config.replay_capacity,
            min_size: config.min_replay_size,
            alpha: config.alpha,
            beta: config.beta,
            priority_epsilon: config.priority_epsilon,
            n_demonstrations: config.n_demonstrations,
            beta_anneal_steps: config.beta_anneal_steps,
        }
    }
}

/// Sampling phase of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorePhase {
    /// Below minimum size; sampling fails with `InsufficientData`.
    Collecting,
    /// Sampling enabled. One-way transition, never reverts.
    Ready,
}

/// One occupied slot: a transition plus its insertion stamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Slot {
    transition: Transition,
    id: u64,
}

/// Serialized checkpoint image of the full store state.
#[derive(Serialize, Deserialize)]
struct StoreSnapshot {
    config: ReplayConfig,
    slots: Vec<Slot>,
    priorities: Vec<f32>,
    next_id: u64,
    max_priority: f32,
    sgd_steps_done: u64,
    collecting_demonstrations: bool,
    phase: StorePhase,
}

/// Prioritized replay store with ring-buffer eviction.
pub struct PrioritizedReplay {
    config: ReplayConfig,
    slots: Vec<Slot>,
    tree: SumTree,
    /// Next insertion stamp; the write slot is `next_id % capacity`.
    next_id: u64,
    /// Largest raw priority seen, assigned to fresh entries so each is
    /// sampled at least once.
    max_priority: f32,
    sgd_steps_done: u64,
    collecting_demonstrations: bool,
    phase: StorePhase,
}

impl PrioritizedReplay {
    /// Create an empty store.
    pub fn new(config: ReplayConfig) -> Self {
        let collecting_demonstrations = config.n_demonstrations > 0;
        Self {
            tree: SumTree::new(config.capacity),
            slots: Vec::with_capacity(config.capacity.min(4096)),
            next_id: 0,
            max_priority: 1.0,
            sgd_steps_done: 0,
            collecting_demonstrations,
            phase: StorePhase::Collecting,
            config,
        }
    }

    /// Number of stored transitions.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Current phase.
    pub fn phase(&self) -> StorePhase {
        self.phase
    }

    /// Total transitions ever inserted (evicted ones included).
    pub fn total_inserted(&self) -> u64 {
        self.next_id
    }

    /// SGD steps acknowledged via priority updates.
    pub fn sgd_steps_done(&self) -> u64 {
        self.sgd_steps_done
    }

    /// True while the store only accepts demonstration data.
    pub fn collecting_demonstrations(&self) -> bool {
        self.collecting_demonstrations
    }

    /// Current annealed beta.
    pub fn beta(&self) -> f32 {
        let progress = if self.config.beta_anneal_steps == 0 {
            1.0
        } else {
            (self.sgd_steps_done as f32 / self.config.beta_anneal_steps as f32).min(1.0)
        };
        self.config.beta + (1.0 - self.config.beta) * progress
    }

    /// Append transitions, each at the current maximum priority.
    ///
    /// Oldest entries are evicted by wraparound once capacity is reached.
    /// While demonstrations are being collected, agent transitions are
    /// discarded (they were generated before the data request switched).
    pub fn insert(&mut self, transitions: Vec<Transition>) {
        let initial_priority = (self.max_priority + self.config.priority_epsilon)
            .powf(self.config.alpha);

        for transition in transitions {
            if self.collecting_demonstrations && !transition.is_demonstration {
                log::debug!("discarding agent transition during demonstration collection");
                continue;
            }

            let slot_idx = (self.next_id % self.config.capacity as u64) as usize;
            let slot = Slot {
                transition,
                id: self.next_id,
            };
            if slot_idx < self.slots.len() {
                self.slots[slot_idx] = slot;
            } else {
                self.slots.push(slot);
            }
            self.tree.update(slot_idx, initial_priority);
            self.next_id += 1;
        }

        if self.phase == StorePhase::Collecting && self.slots.len() >= self.config.min_size {
            self.phase = StorePhase::Ready;
            log::info!(
                "replay store ready: {} entries (minimum {})",
                self.slots.len(),
                self.config.min_size
            );
        }

        // One-way flip: the demonstration quota counts insertions, so the
        // phase ends exactly when the configured count has been filled.
        if self.collecting_demonstrations && self.next_id >= self.config.n_demonstrations as u64 {
            self.collecting_demonstrations = false;
            log::info!(
                "demonstration phase complete after {} transitions; switching to agent data",
                self.next_id
            );
        }
    }

    /// Draw a batch with probability proportional to `priority^alpha`.
    ///
    /// Draws are without replacement within the round. Probabilities are
    /// taken against the pre-round total; importance weights
    /// `(N * P(i))^-beta` are normalized by the batch maximum.
    pub fn sample(&mut self, batch_size: usize) -> Result<SampledBatch> {
        if self.phase == StorePhase::Collecting {
            return Err(ApexError::InsufficientData {
                len: self.slots.len(),
                min_size: self.config.min_size,
            });
        }

        let n = self.slots.len();
        let round = batch_size.min(n);
        let total = self.tree.total();
        if total <= 0.0 {
            return Err(ApexError::InsufficientData {
                len: 0,
                min_size: self.config.min_size,
            });
        }

        let mut rng = rand::thread_rng();
        let mut drawn: Vec<(usize, f32)> = Vec::with_capacity(round);

        // Remove each drawn leaf for the rest of the round, restoring all
        // priorities before returning.
        for _ in 0..round {
            let remaining = self.tree.total();
            if remaining <= 0.0 {
                break;
            }
            let value = rng.gen_range(0.0..remaining);
            let (slot_idx, priority) = self.tree.sample(value);
            drawn.push((slot_idx, priority));
            self.tree.update(slot_idx, 0.0);
        }
        for &(slot_idx, priority) in &drawn {
            self.tree.update(slot_idx, priority);
        }

        let beta = self.beta();
        let mut transitions = Vec::with_capacity(drawn.len());
        let mut ids = Vec::with_capacity(drawn.len());
        let mut probabilities = Vec::with_capacity(drawn.len());
        let mut weights = Vec::with_capacity(drawn.len());

        for &(slot_idx, priority) in &drawn {
            // A draw can land on an empty leaf only through float boundary
            // effects; skip rather than index out of bounds.
            let Some(slot) = self.slots.get(slot_idx) else {
                continue;
            };
            let prob = priority / total;
            transitions.push(slot.transition.clone());
            ids.push(slot.id);
            probabilities.push(prob);
            weights.push((n as f32 * prob).powf(-beta));
        }

        let max_weight = weights.iter().fold(0.0f32, |acc, &w| acc.max(w));
        if max_weight > 0.0 {
            for w in &mut weights {
                *w /= max_weight;
            }
        }

        Ok(SampledBatch {
            transitions,
            ids,
            probabilities,
            weights,
            sgd_step: self.sgd_steps_done,
        })
    }

    /// Overwrite priorities for the given insertion stamps.
    ///
    /// Stamps whose entry has been evicted by wraparound are ignored:
    /// late-returning priorities are expected, not an error.
    pub fn update_priorities(&mut self, ids: &[u64], priorities: &[f32]) {
        for (&id, &priority) in ids.iter().zip(priorities.iter()) {
            let slot_idx = (id % self.config.capacity as u64) as usize;
            let live = self
                .slots
                .get(slot_idx)
                .map(|s| s.id == id)
                .unwrap_or(false);
            if !live {
                log::debug!("priority update for evicted id {id} dropped");
                continue;
            }
            let raw = priority.abs() + self.config.priority_epsilon;
            self.tree.update(slot_idx, raw.powf(self.config.alpha));
            self.max_priority = self.max_priority.max(raw);
        }
    }

    /// Record one completed SGD step (advances beta annealing).
    pub fn record_sgd_step(&mut self) {
        self.sgd_steps_done += 1;
    }

    /// Sampling probability of the entry with stamp `id`, if still stored.
    pub fn probability_of(&self, id: u64) -> Option<f32> {
        let slot_idx = (id % self.config.capacity as u64) as usize;
        let slot = self.slots.get(slot_idx)?;
        if slot.id != id {
            return None;
        }
        let total = self.tree.total();
        if total <= 0.0 {
            return None;
        }
        Some(self.tree.get_priority(slot_idx) / total)
    }

    /// Persist the full store state (entries, priorities, counters).
    ///
    /// Written to a temporary file and renamed, so a crash mid-write
    /// leaves the previous checkpoint intact.
    pub fn save_checkpoint(&self, path: &Path) -> Result<()> {
        let snapshot = StoreSnapshot {
            config: self.config.clone(),
            slots: self.slots.clone(),
            priorities: self.tree.leaves()[..self.slots.len()].to_vec(),
            next_id: self.next_id,
            max_priority: self.max_priority,
            sgd_steps_done: self.sgd_steps_done,
            collecting_demonstrations: self.collecting_demonstrations,
            phase: self.phase,
        };
        let bytes = bincode::serialize(&snapshot)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Restore from a checkpoint, falling back to a fresh store when the
    /// file is missing or corrupt. A fallback is a warning, not a crash.
    pub fn load_or_new(config: ReplayConfig, path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(store) => {
                log::info!(
                    "restored replay store from {} ({} entries, next_id {})",
                    path.display(),
                    store.len(),
                    store.next_id
                );
                store
            }
            Err(e) => {
                log::warn!(
                    "could not restore replay store from {} ({e}); starting fresh",
                    path.display()
                );
                Self::new(config)
            }
        }
    }

    fn try_load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let snapshot: StoreSnapshot = bincode::deserialize(&bytes)?;

        let mut tree = SumTree::new(snapshot.config.capacity);
        for (idx, &priority) in snapshot.priorities.iter().enumerate() {
            tree.update(idx, priority);
        }

        Ok(Self {
            config: snapshot.config,
            slots: snapshot.slots,
            tree,
            next_id: snapshot.next_id,
            max_priority: snapshot.max_priority,
            sgd_steps_done: snapshot.sgd_steps_done,
            collecting_demonstrations: snapshot.collecting_demonstrations,
            phase: snapshot.phase,
        })
    }
}
