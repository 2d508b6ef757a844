//! Replay server actor: owns the prioritized store and its sockets.
//!
//! Single-threaded loop interleaving three non-blocking duties:
//! draining worker transitions, keeping batches in flight to the learner,
//! and applying returned priorities. Backpressure comes from the
//! `max_pending_batches` window: one slot frees per priority update
//! received.

use crate::config::ApexConfig;
use crate::coordinator::liveness;
use crate::endpoints::{Channel, EndpointMap};
use crate::error::Result;
use crate::messages::{ActorId, DataKind, Envelope};
use crate::replay::store::{PrioritizedReplay, ReplayConfig};
use crate::transport::{PubSocket, PullSocket, PushSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// The replay server process.
pub struct ReplayServer {
    config: ApexConfig,
    store: PrioritizedReplay,
    from_workers: PullSocket,
    from_learner: PullSocket,
    to_learner: PushSocket,
    data_requests: PubSocket,
    /// Batches in flight to the learner, bounded by `max_pending_batches`.
    pending_batches: usize,
    last_checkpoint_step: u64,
}

impl ReplayServer {
    /// Bootstrap the replay server.
    ///
    /// Connects to the coordinator rendezvous endpoint and the learner's
    /// batch intake (both already known), binds this actor's three ports,
    /// and reports them to the coordinator and to the learner. With
    /// `resume`, the store is restored from its last checkpoint.
    pub fn bootstrap(config: ApexConfig, known: &EndpointMap, resume: bool) -> Result<Self> {
        let timeout = Duration::from_secs(config.handshake_timeout_secs);
        let mut to_coordinator =
            PushSocket::connect_retry(known.require(Channel::CoordinatorLogs)?, timeout)?;
        let mut to_learner =
            PushSocket::connect_retry(known.require(Channel::ReplayToLearner)?, timeout)?;

        let (from_learner, learner_port) = PullSocket::bind(config.min_port, config.port_range)?;
        let (from_workers, workers_port) = PullSocket::bind(config.min_port, config.port_range)?;
        let (data_requests, request_port) = PubSocket::bind(config.min_port, config.port_range)?;

        let bound = vec![
            (Channel::LearnerToReplay, learner_port),
            (Channel::WorkersToReplay, workers_port),
            (Channel::DataRequestPubSub, request_port),
        ];
        let handshake = Envelope::Handshake {
            actor: ActorId::ReplayServer,
            endpoints: bound,
        };
        to_coordinator.send(&handshake)?;
        // The learner is blocked on its batch intake waiting for this; it
        // connects its priority push to `learner_port` on receipt.
        to_learner.send(&handshake)?;

        liveness::write_pid_file(&config, ActorId::ReplayServer)?;

        let replay_config = ReplayConfig::from_apex(&config);
        let store = if resume {
            PrioritizedReplay::load_or_new(replay_config, &config.replay_checkpoint_path())
        } else {
            PrioritizedReplay::new(replay_config)
        };

        log::info!(
            "replay server bootstrapped: learner={learner_port} workers={workers_port} requests={request_port}"
        );

        Ok(Self {
            config,
            store,
            from_workers,
            from_learner,
            to_learner,
            data_requests,
            pending_batches: 0,
            last_checkpoint_step: 0,
        })
    }

    /// Read-only view of the store, for tests and diagnostics.
    pub fn store(&self) -> &PrioritizedReplay {
        &self.store
    }

    /// Batches currently in flight.
    pub fn pending_batches(&self) -> usize {
        self.pending_batches
    }

    /// Broadcast which kind of data workers should generate.
    pub fn request_data(&mut self, kind: DataKind) -> Result<()> {
        log::debug!("requesting {kind:?} data from workers");
        self.data_requests.publish(&Envelope::DataRequest { kind })
    }

    /// Main loop; exits when `shutdown` is set.
    ///
    /// While demonstrations are still being collected the data request is
    /// re-broadcast periodically, so workers that subscribe after the
    /// first publish still hear it.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let kind = if self.store.collecting_demonstrations() {
            DataKind::Demonstration
        } else {
            DataKind::Agent
        };
        self.request_data(kind)?;
        let mut last_request = std::time::Instant::now();

        while !shutdown.load(Ordering::Relaxed) {
            let mut progressed = false;
            progressed |= self.recv_replay_data()?;
            progressed |= self.send_batches();
            progressed |= self.recv_new_priorities()?;

            if self.store.collecting_demonstrations()
                && last_request.elapsed() >= Duration::from_millis(100)
            {
                self.request_data(DataKind::Demonstration)?;
                last_request = std::time::Instant::now();
            }

            if !progressed {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        Ok(())
    }

    /// Drain pending worker packets into the store.
    ///
    /// Returns true if anything was received. A demonstration-phase
    /// completion triggers the switch to agent data.
    pub fn recv_replay_data(&mut self) -> Result<bool> {
        let mut received = false;
        while let Some(envelope) = self.from_workers.try_recv()? {
            match envelope {
                Envelope::ReplayData { transitions } => {
                    received = true;
                    let was_demo = self.store.collecting_demonstrations();
                    self.store.insert(transitions);
                    if was_demo && !self.store.collecting_demonstrations() {
                        self.request_data(DataKind::Agent)?;
                    }
                }
                other => {
                    log::debug!("replay server dropping unexpected {} packet", other.tag());
                }
            }
        }
        Ok(received)
    }

    /// Keep up to `max_pending_batches` sampled batches in flight.
    ///
    /// Sampling before the store is ready is expected and simply leaves
    /// the window unfilled; a failed send means the learner is gone and
    /// the batch is lost (it will be resampled).
    pub fn send_batches(&mut self) -> bool {
        let mut sent = false;
        while self.pending_batches < self.config.max_pending_batches {
            let batch = match self.store.sample(self.config.batch_size) {
                Ok(batch) => batch,
                Err(_) => break,
            };
            match self.to_learner.send(&Envelope::Batch(batch)) {
                Ok(()) => {
                    self.pending_batches += 1;
                    sent = true;
                }
                Err(e) => {
                    log::warn!("batch send failed ({e}); learner unreachable");
                    break;
                }
            }
        }
        sent
    }

    /// Apply any returned priority updates.
    ///
    /// Each update frees one slot in the pending-batch window, advances
    /// the SGD-step counter, and periodically checkpoints the store.
    pub fn recv_new_priorities(&mut self) -> Result<bool> {
        let mut received = false;
        while let Some(envelope) = self.from_learner.try_recv()? {
            match envelope {
                Envelope::Priorities { ids, priorities, .. } => {
                    received = true;
                    self.store.update_priorities(&ids, &priorities);
                    self.store.record_sgd_step();
                    self.pending_batches = self.pending_batches.saturating_sub(1);
                    self.maybe_checkpoint();
                }
                other => {
                    log::debug!("replay server dropping unexpected {} packet", other.tag());
                }
            }
        }
        Ok(received)
    }

    fn maybe_checkpoint(&mut self) {
        let step = self.store.sgd_steps_done();
        if self.config.checkpoint_interval == 0
            || step < self.last_checkpoint_step + self.config.checkpoint_interval
        {
            return;
        }
        let path = self.config.replay_checkpoint_path();
        match self.store.save_checkpoint(&path) {
            Ok(()) => {
                self.last_checkpoint_step = step;
                log::info!("replay store checkpointed at sgd step {step}");
            }
            Err(e) => log::warn!("replay checkpoint failed: {e}"),
        }
    }
}
