//! Worker actor: generates experience and ships it to the replay server.
//!
//! Workers never block in steady state: parameter and data-request
//! broadcasts are polled, replay shipments are fire-and-forget. A lost
//! shipment is one of many future batches; nothing retries.
//!
//! The tester variant generates no training data. It evaluates each newly
//! received parameter snapshot on the validation instances and reports
//! the results to the coordinator.

use crate::config::ApexConfig;
use crate::coordinator::liveness;
use crate::core::{ModelParameters, Transition};
use crate::endpoints::{Channel, EndpointMap};
use crate::environment::Environment;
use crate::error::Result;
use crate::messages::{ActorId, DataKind, Envelope, LogPayload};
use crate::replay::LocalBuffer;
use crate::transport::{PushSocket, SubSocket};
use crate::worker::stats::WorkerStats;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Base exploration rate; worker i uses `BASE^(1 + i/(N-1) * LADDER)`.
const EPSILON_BASE: f32 = 0.4;
const EPSILON_LADDER: f32 = 7.0;

/// Per-worker exploration rate on the Ape-X epsilon ladder.
///
/// Worker 1 explores the most, worker N the least; the tester is greedy.
fn epsilon_for(id: ActorId, num_workers: u32) -> f32 {
    match id {
        ActorId::Worker(n) => {
            let denom = num_workers.saturating_sub(1).max(1) as f32;
            EPSILON_BASE.powf(1.0 + (n.saturating_sub(1)) as f32 * EPSILON_LADDER / denom)
        }
        _ => 0.0,
    }
}

/// A data-generating (or evaluating) worker process.
pub struct Worker<E: Environment> {
    id: ActorId,
    env: E,
    local: LocalBuffer,
    to_replay: PushSocket,
    to_coordinator: PushSocket,
    params_sub: SubSocket,
    requests_sub: SubSocket,
    /// Latest applied parameters; starts at version 0 (untrained).
    params: ModelParameters,
    data_kind: DataKind,
    epsilon: f32,
    stats: WorkerStats,
    is_tester: bool,
}

impl<E: Environment> Worker<E> {
    /// Bootstrap a worker against a fully negotiated endpoint map.
    ///
    /// Workers are spawned last, so every channel is already known; no
    /// handshake report is needed, only connects.
    pub fn bootstrap(
        config: &ApexConfig,
        known: &EndpointMap,
        id: ActorId,
        env: E,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(config.handshake_timeout_secs);
        let to_replay =
            PushSocket::connect_retry(known.require(Channel::WorkersToReplay)?, timeout)?;
        let to_coordinator =
            PushSocket::connect_retry(known.require(Channel::CoordinatorLogs)?, timeout)?;
        let params_sub =
            SubSocket::connect_retry(known.require(Channel::ParamsPubSub)?, timeout)?;
        let requests_sub =
            SubSocket::connect_retry(known.require(Channel::DataRequestPubSub)?, timeout)?;

        liveness::write_pid_file(config, id)?;
        let is_tester = id == ActorId::Tester;
        log::info!("{id} bootstrapped");

        Ok(Self {
            id,
            env,
            local: LocalBuffer::new(config.local_buffer_size),
            to_replay,
            to_coordinator,
            params_sub,
            requests_sub,
            params: ModelParameters::new(0, Vec::new()),
            data_kind: DataKind::Agent,
            epsilon: epsilon_for(id, config.num_workers),
            stats: WorkerStats::default(),
            is_tester,
        })
    }

    /// This worker's exploration rate.
    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    /// Latest applied parameter version.
    pub fn param_version(&self) -> u64 {
        self.params.version
    }

    /// Running statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Drive the environment until the local buffer fills, then drain it.
    ///
    /// A parameter swap between environment steps invalidates any
    /// exploration state tied to the old policy; the environment must
    /// tolerate that (there is no rollback).
    pub fn collect_data(&mut self) -> Vec<Transition> {
        while !self.local.is_full() {
            let demonstration = self.data_kind == DataKind::Demonstration;
            let transitions = self
                .env
                .collect_step(&self.params, self.epsilon, demonstration);
            self.stats.add_steps(transitions.len());
            for t in &transitions {
                if t.terminal {
                    self.stats.record_episode(t.reward);
                }
            }
            self.local.extend(transitions);
        }
        self.local.take()
    }

    /// Ship a replay packet, fire-and-forget.
    ///
    /// Loss here is tolerated: the pipeline resamples and the next
    /// shipment is already being generated.
    pub fn send_replay_data(&mut self, transitions: Vec<Transition>) {
        if transitions.is_empty() {
            return;
        }
        if let Err(e) = self.to_replay.send(&Envelope::ReplayData { transitions }) {
            log::debug!("{} replay shipment lost ({e})", self.id);
        }
    }

    /// Poll both broadcast channels, applying only the newest messages.
    ///
    /// Returns true when a newer parameter snapshot was applied. A data
    /// kind switch discards locally staged transitions of the old kind.
    pub fn recv_messages(&mut self) -> Result<bool> {
        if let Some(Envelope::DataRequest { kind }) = self.requests_sub.latest()? {
            if kind != self.data_kind {
                log::info!("{} switching to {kind:?} data generation", self.id);
                self.data_kind = kind;
                self.local.clear();
            }
        }

        let mut applied = false;
        if let Some(Envelope::Params(params)) = self.params_sub.latest()? {
            if self.params.is_older_than(&params) {
                log::debug!("{} applying params version {}", self.id, params.version);
                self.params = params;
                self.stats.param_updates += 1;
                applied = true;
            }
        }
        Ok(applied)
    }

    /// Send a training log packet for `step`.
    pub fn log_stats(&mut self, step: u64) {
        let envelope = Envelope::Log {
            sender: self.id,
            step,
            payload: LogPayload::training(self.stats.as_metrics()),
        };
        if let Err(e) = self.to_coordinator.send(&envelope) {
            log::debug!("{} log packet lost ({e})", self.id);
        }
    }

    /// Evaluate the current parameters and report validation results.
    pub fn evaluate(&mut self, step: u64) {
        let records = self.env.evaluate(&self.params);
        let envelope = Envelope::Log {
            sender: self.id,
            step,
            payload: LogPayload::validation(records),
        };
        if let Err(e) = self.to_coordinator.send(&envelope) {
            log::debug!("{} validation packet lost ({e})", self.id);
        }
    }

    /// Main loop; exits when `shutdown` is set.
    ///
    /// Data workers interleave collection and shipping with message
    /// polling, logging once per applied parameter version. The tester
    /// only reacts to new versions.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            let applied = self.recv_messages()?;

            if self.is_tester {
                if applied {
                    self.evaluate(self.params.version);
                } else {
                    std::thread::sleep(Duration::from_millis(1));
                }
                continue;
            }

            if applied {
                self.log_stats(self.params.version);
            }
            let data = self.collect_data();
            self.send_replay_data(data);
        }
        Ok(())
    }
}
