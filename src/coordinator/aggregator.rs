//! Per-step aggregation of log packets from all actors.
//!
//! Packets arrive interleaved and out of order across senders. A step is
//! "finished" once every tracked actor has reported a step at or beyond
//! it; finished steps flush strictly in step order. When the backlog of
//! unfinished steps grows past its bound, a dead or stalled actor is the
//! likely cause and the oldest steps are force-flushed with whatever data
//! arrived, so the pipeline never blocks indefinitely.

use crate::messages::{ActorId, EvalRecord, LogPayload};
use std::collections::{BTreeMap, VecDeque};

/// What happened to an ingested packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketOutcome {
    /// Buffered for aggregation.
    Accepted,
    /// Step already flushed; packet discarded without touching history.
    Stale,
    /// Sender's step did not increase; packet discarded.
    NonMonotonic,
}

/// Data buffered for one not-yet-finished step.
#[derive(Debug, Default)]
struct StepData {
    /// key -> (sum, count) across senders.
    training: BTreeMap<String, (f64, u64)>,
    validation: Vec<EvalRecord>,
}

/// One flushed step, ready for the metrics sink.
#[derive(Debug)]
pub struct FlushedStep {
    pub step: u64,
    /// Averaged training scalars plus `{dataset}/{key}` validation means.
    pub metrics: Vec<(String, f64)>,
    /// Per-dataset mean of the objective key, for best-model tracking.
    pub objectives: Vec<(String, f64)>,
    /// True when flushed by the backlog bound rather than completion.
    pub forced: bool,
    /// Tracked actors that had not reached this step at flush time.
    pub laggards: Vec<ActorId>,
}

/// Step-ordered aggregator with forced-flush backpressure relief.
pub struct StepAggregator {
    /// Actors whose step counters gate a step's completion.
    tracked: Vec<ActorId>,
    /// Last step seen per sender; starts below any valid step.
    step_counter: BTreeMap<ActorId, i64>,
    /// Steps with buffered data, ascending.
    unfinished: VecDeque<u64>,
    history: BTreeMap<u64, StepData>,
    last_logging_step: i64,
    max_unfinished: usize,
    /// Validation metric key used for best-performance tracking.
    objective_key: String,
}

impl StepAggregator {
    /// Create an aggregator gating on `tracked` actors.
    pub fn new(tracked: Vec<ActorId>, max_unfinished: usize, objective_key: &str) -> Self {
        let step_counter = tracked.iter().map(|&a| (a, -1)).collect();
        Self {
            tracked,
            step_counter,
            unfinished: VecDeque::new(),
            history: BTreeMap::new(),
            last_logging_step: -1,
            max_unfinished,
            objective_key: objective_key.to_string(),
        }
    }

    /// Restore sender counters and the flush cursor from a checkpoint.
    pub fn restore_counters(&mut self, counters: &[(ActorId, i64)], last_logging_step: i64) {
        for &(actor, step) in counters {
            if let Some(entry) = self.step_counter.get_mut(&actor) {
                *entry = step;
            }
        }
        self.last_logging_step = last_logging_step;
    }

    /// Last flushed step (-1 before the first flush).
    pub fn last_logging_step(&self) -> i64 {
        self.last_logging_step
    }

    /// Current sender counters, for checkpointing.
    pub fn counters(&self) -> Vec<(ActorId, i64)> {
        self.step_counter.iter().map(|(&a, &s)| (a, s)).collect()
    }

    /// Number of buffered, not-yet-flushed steps.
    pub fn backlog(&self) -> usize {
        self.unfinished.len()
    }

    /// Ingest one log packet.
    ///
    /// Untracked senders (replay server, tester) contribute data but do
    /// not gate completion; their monotonicity is not enforced.
    pub fn ingest(&mut self, sender: ActorId, step: u64, payload: LogPayload) -> PacketOutcome {
        if let Some(counter) = self.step_counter.get_mut(&sender) {
            if (step as i64) <= *counter {
                log::warn!("non-monotonic packet from {sender}: step {step} after {counter}");
                return PacketOutcome::NonMonotonic;
            }
            *counter = step as i64;
        }

        if (step as i64) <= self.last_logging_step {
            log::debug!(
                "outdated packet from {sender} discarded (last logging step {}, packet step {step})",
                self.last_logging_step
            );
            return PacketOutcome::Stale;
        }

        let data = self.history.entry(step).or_default();
        for (key, value) in payload.training {
            if !value.is_finite() {
                continue;
            }
            let entry = data.training.entry(key).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
        data.validation.extend(payload.validation);

        match self.unfinished.binary_search(&step) {
            Ok(_) => {}
            Err(pos) => self.unfinished.insert(pos, step),
        }
        PacketOutcome::Accepted
    }

    /// Pop every step that can flush right now, in step order.
    ///
    /// A step flushes normally when all tracked counters have reached it,
    /// or forcibly while the backlog exceeds the bound.
    pub fn finished_steps(&mut self) -> Vec<FlushedStep> {
        let mut flushed = Vec::new();
        while let Some(&front) = self.unfinished.front() {
            let complete = self
                .step_counter
                .values()
                .all(|&counter| counter >= front as i64);
            let forced = !complete && self.unfinished.len() > self.max_unfinished;
            if !complete && !forced {
                break;
            }

            self.unfinished.pop_front();
            let data = self.history.remove(&front).unwrap_or_default();
            let laggards: Vec<ActorId> = if forced {
                self.tracked
                    .iter()
                    .copied()
                    .filter(|a| self.step_counter[a] < front as i64)
                    .collect()
            } else {
                Vec::new()
            };
            if forced {
                log::warn!(
                    "force-flushing step {front}; likely dead or stalled: {}",
                    laggards
                        .iter()
                        .map(|a| a.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }

            self.last_logging_step = front as i64;
            flushed.push(Self::finish_step(front, data, forced, laggards, &self.objective_key));
        }
        flushed
    }

    /// Average the buffered data for one step.
    fn finish_step(
        step: u64,
        data: StepData,
        forced: bool,
        laggards: Vec<ActorId>,
        objective_key: &str,
    ) -> FlushedStep {
        let mut metrics: Vec<(String, f64)> = data
            .training
            .into_iter()
            .map(|(key, (sum, count))| (format!("training/{key}"), sum / count.max(1) as f64))
            .collect();

        // Group validation records by dataset, averaging each metric key
        // across (instance, seed) episodes.
        let mut by_dataset: BTreeMap<String, BTreeMap<String, (f64, u64)>> = BTreeMap::new();
        for record in &data.validation {
            let dataset = by_dataset.entry(record.dataset.clone()).or_default();
            for (key, value) in &record.metrics {
                if !value.is_finite() {
                    continue;
                }
                let entry = dataset.entry(key.clone()).or_insert((0.0, 0));
                entry.0 += value;
                entry.1 += 1;
            }
        }

        let mut objectives = Vec::new();
        for (dataset, keys) in by_dataset {
            for (key, (sum, count)) in keys {
                let mean = sum / count.max(1) as f64;
                if key == objective_key {
                    objectives.push((dataset.clone(), mean));
                }
                metrics.push((format!("{dataset}/{key}"), mean));
            }
        }

        FlushedStep {
            step,
            metrics,
            objectives,
            forced,
            laggards,
        }
    }
}
