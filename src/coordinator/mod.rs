//! Coordinator: bootstrap handshake, log aggregation, run-state
//! checkpointing, and restart orchestration.
//!
//! Bootstrap is a sequential, blocking protocol: each actor's ports must
//! be known before the next actor can be given them. Every wait is
//! bounded by the handshake timeout, though. Once the
//! endpoint map is persisted the coordinator enters its aggregation loop
//! and never blocks again.

pub mod aggregator;
pub mod liveness;

#[cfg(test)]
mod tests;

pub use aggregator::{FlushedStep, PacketOutcome, StepAggregator};

use crate::config::ApexConfig;
use crate::endpoints::{Channel, EndpointMap};
use crate::error::{ApexError, Result};
use crate::messages::{ActorId, Envelope};
use crate::metrics::MetricsSink;
use crate::transport::PullSocket;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Seam to the external actor-lifecycle manager.
///
/// The coordinator never forks processes itself; it asks the launcher to
/// start an actor with an immutable endpoint snapshot. Tests implement
/// this with plain threads.
pub trait Launcher {
    /// Start `actor` with the endpoints known so far.
    fn launch(&mut self, actor: ActorId, config: &ApexConfig, known: &EndpointMap) -> Result<()>;
}

/// Checkpointed coordinator state, restored on `resume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// Last step seen per sender, keyed by actor name.
    pub step_counter: BTreeMap<String, i64>,
    /// Last fully flushed step.
    pub last_logging_step: i64,
    /// Best objective value per validation dataset.
    pub best_performance: BTreeMap<String, f64>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            step_counter: BTreeMap::new(),
            last_logging_step: -1,
            best_performance: BTreeMap::new(),
        }
    }
}

impl RunState {
    /// Persist as JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| ApexError::Checkpoint(e.to_string()))?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Load, falling back to a fresh state when missing or corrupt.
    pub fn load_or_default(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(state) => state,
                Err(e) => {
                    log::warn!("corrupt run state at {} ({e}); starting fresh", path.display());
                    Self::default()
                }
            },
            Err(_) => {
                log::warn!("no run state at {}; starting fresh", path.display());
                Self::default()
            }
        }
    }
}

/// The coordinator actor.
pub struct Coordinator {
    config: ApexConfig,
    logs: PullSocket,
    endpoints: EndpointMap,
    aggregator: StepAggregator,
    best_performance: BTreeMap<String, f64>,
    sink: Box<dyn MetricsSink>,
}

impl Coordinator {
    /// Actors whose step counters gate a step's completion.
    fn tracked_actors(config: &ApexConfig) -> Vec<ActorId> {
        let mut tracked: Vec<ActorId> =
            (1..=config.num_workers).map(ActorId::Worker).collect();
        tracked.push(ActorId::Learner);
        tracked
    }

    /// Run the full bootstrap handshake for a fresh run.
    ///
    /// Binds the rendezvous socket, spawns the learner, the replay server
    /// and the workers in sequence (each wait bounded by the handshake
    /// timeout), persists the endpoint map, and returns the coordinator
    /// ready for its aggregation loop. With `resume`, prior run state is
    /// restored first.
    pub fn setup(
        config: ApexConfig,
        launcher: &mut dyn Launcher,
        sink: Box<dyn MetricsSink>,
        resume: bool,
    ) -> Result<Self> {
        config.validate()?;
        config.ensure_run_dir()?;

        let (mut logs, log_port) = PullSocket::bind(config.min_port, config.port_range)?;
        let mut endpoints = EndpointMap::new();
        endpoints.insert(Channel::CoordinatorLogs, log_port);
        log::info!("coordinator bound log port {log_port}");

        let timeout = Duration::from_secs(config.handshake_timeout_secs);

        log::info!("spawning learner");
        launcher.launch(ActorId::Learner, &config, &endpoints)?;
        let learner_ports = Self::await_handshake(&mut logs, ActorId::Learner, timeout)?;
        endpoints.extend(&learner_ports);

        log::info!("spawning replay server");
        launcher.launch(ActorId::ReplayServer, &config, &endpoints)?;
        let replay_ports = Self::await_handshake(&mut logs, ActorId::ReplayServer, timeout)?;
        endpoints.extend(&replay_ports);

        log::info!("spawning {} workers and tester", config.num_workers);
        for n in 1..=config.num_workers {
            launcher.launch(ActorId::Worker(n), &config, &endpoints)?;
        }
        launcher.launch(ActorId::Tester, &config, &endpoints)?;

        let endpoints_path = config.endpoints_path();
        endpoints.save(&endpoints_path)?;
        log::info!("saved endpoint map to {}", endpoints_path.display());

        liveness::write_pid_file(&config, ActorId::Coordinator)?;

        let mut aggregator = StepAggregator::new(
            Self::tracked_actors(&config),
            config.max_unfinished_steps,
            &config.objective_key,
        );
        let mut best_performance = BTreeMap::new();

        if resume {
            let state = RunState::load_or_default(&config.run_state_path());
            let counters: Vec<(ActorId, i64)> = aggregator
                .counters()
                .into_iter()
                .map(|(actor, _)| {
                    let restored = state
                        .step_counter
                        .get(&actor.to_string())
                        .copied()
                        .unwrap_or(-1);
                    (actor, restored)
                })
                .collect();
            aggregator.restore_counters(&counters, state.last_logging_step);
            best_performance = state.best_performance;
            log::info!(
                "resumed run state: last logging step {}",
                state.last_logging_step
            );
        }

        Ok(Self {
            config,
            logs,
            endpoints,
            aggregator,
            best_performance,
            sink,
        })
    }

    /// Rebind the coordinator against an already-negotiated endpoint map.
    ///
    /// Used when only the coordinator is restarted: the persisted map must
    /// exist, and the rendezvous port recorded there must still be free.
    pub fn reattach(config: ApexConfig, sink: Box<dyn MetricsSink>) -> Result<Self> {
        config.validate()?;
        let endpoints = EndpointMap::load(&config.endpoints_path())?;
        let port = endpoints.require(Channel::CoordinatorLogs)?.port();
        let (logs, _) = PullSocket::bind(port, 1)?;
        liveness::write_pid_file(&config, ActorId::Coordinator)?;

        let state = RunState::load_or_default(&config.run_state_path());
        let mut aggregator = StepAggregator::new(
            Self::tracked_actors(&config),
            config.max_unfinished_steps,
            &config.objective_key,
        );
        let counters: Vec<(ActorId, i64)> = Self::tracked_actors(&config)
            .into_iter()
            .map(|actor| {
                let restored = state
                    .step_counter
                    .get(&actor.to_string())
                    .copied()
                    .unwrap_or(-1);
                (actor, restored)
            })
            .collect();
        aggregator.restore_counters(&counters, state.last_logging_step);

        Ok(Self {
            config,
            logs,
            endpoints,
            aggregator,
            best_performance: state.best_performance,
            sink,
        })
    }

    /// Respawn specific actors against the persisted endpoint map.
    ///
    /// An actor found alive is an error unless `force` is set, in which
    /// case it is killed first. Fails with a descriptive error when no
    /// endpoint map has been persisted (a restart cannot allocate fresh
    /// ports without desynchronizing the rest of the topology).
    pub fn restart_actors(
        config: &ApexConfig,
        launcher: &mut dyn Launcher,
        actors: &[ActorId],
        force: bool,
    ) -> Result<()> {
        let endpoints = EndpointMap::load(&config.endpoints_path())?;

        for &actor in actors {
            if let Some(pid) = liveness::live_pid(config, actor) {
                if !force {
                    return Err(ApexError::ActorAlive {
                        actor: actor.to_string(),
                        pid,
                    });
                }
                log::warn!("killing live {actor} (pid {pid}) before respawn");
                liveness::kill_process(pid)?;
            }
            log::info!("respawning {actor}");
            launcher.launch(actor, config, &endpoints)?;
        }
        Ok(())
    }

    /// The negotiated endpoint map.
    pub fn endpoints(&self) -> &EndpointMap {
        &self.endpoints
    }

    /// Aggregator access for tests and diagnostics.
    pub fn aggregator(&self) -> &StepAggregator {
        &self.aggregator
    }

    /// Best objective per validation dataset seen so far.
    pub fn best_performance(&self) -> &BTreeMap<String, f64> {
        &self.best_performance
    }

    fn await_handshake(
        logs: &mut PullSocket,
        expected: ActorId,
        timeout: Duration,
    ) -> Result<Vec<(Channel, u16)>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ApexError::BootstrapTimeout {
                    actor: expected.to_string(),
                    waited_secs: timeout.as_secs_f64(),
                });
            }
            match logs.recv_timeout(remaining)? {
                Some(Envelope::Handshake { actor, endpoints }) if actor == expected => {
                    return Ok(endpoints);
                }
                Some(other) => {
                    log::debug!(
                        "ignoring {} packet while waiting for {expected} handshake",
                        other.tag()
                    );
                }
                None => {
                    return Err(ApexError::BootstrapTimeout {
                        actor: expected.to_string(),
                        waited_secs: timeout.as_secs_f64(),
                    });
                }
            }
        }
    }

    /// Process one pending log packet; returns true if one was handled.
    pub fn poll_once(&mut self) -> Result<bool> {
        let Some(envelope) = self.logs.try_recv()? else {
            return Ok(false);
        };
        match envelope {
            Envelope::Log { sender, step, payload } => {
                self.aggregator.ingest(sender, step, payload);
                self.flush_finished()?;
            }
            other => {
                log::debug!("coordinator dropping unexpected {} packet", other.tag());
            }
        }
        Ok(true)
    }

    /// The aggregation loop: runs until `shutdown` is set.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        log::info!("coordinator entering aggregation loop");
        while !shutdown.load(Ordering::Relaxed) {
            if !self.poll_once()? {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        self.sink.flush();
        Ok(())
    }

    fn flush_finished(&mut self) -> Result<()> {
        for flushed in self.aggregator.finished_steps() {
            for (dataset, value) in &flushed.objectives {
                let best = self
                    .best_performance
                    .entry(dataset.clone())
                    .or_insert(f64::NEG_INFINITY);
                if *value > *best {
                    *best = *value;
                    log::info!("new best {} on {dataset}: {value:.4}", self.config.objective_key);
                }
            }
            self.sink.log_step(flushed.step, &flushed.metrics);
            self.save_run_state()?;
        }
        Ok(())
    }

    fn save_run_state(&self) -> Result<()> {
        let state = RunState {
            step_counter: self
                .aggregator
                .counters()
                .into_iter()
                .map(|(actor, step)| (actor.to_string(), step))
                .collect(),
            last_logging_step: self.aggregator.last_logging_step(),
            best_performance: self.best_performance.clone(),
        };
        state.save(&self.config.run_state_path())
    }
}
