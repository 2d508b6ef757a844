//! Learner actor: batch intake, optimization, priority return, parameter
//! broadcast.
//!
//! The learner splits into two concurrently running halves so network I/O
//! never blocks optimization (and vice versa):
//!
//! ```text
//!   replay ──Batch──> [io loop] ──batch queue──> [optimize loop]
//!   replay <─Priorities─ [io loop] <─priority queue─ [optimize loop]
//!   workers <─Params (pub)─ [io loop] <─params queue─ [optimize loop]
//! ```
//!
//! Each queue has a single producer and a single consumer, so the bounded
//! crossbeam channels provide all the synchronization needed.

use crate::config::ApexConfig;
use crate::coordinator::liveness;
use crate::core::{ModelParameters, VersionCounter};
use crate::endpoints::{Channel, EndpointMap};
use crate::error::{ApexError, Result};
use crate::learner::optimizer::Optimizer;
use crate::messages::{ActorId, Envelope, LogPayload, SampledBatch};
use crate::transport::{PubSocket, PullSocket, PushSocket};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Priority update staged for the io loop to forward.
struct PriorityUpdate {
    ids: Vec<u64>,
    priorities: Vec<f32>,
    sgd_step: u64,
}

/// Socket half of the learner. Runs on the io thread.
pub struct LearnerIo {
    from_replay: PullSocket,
    to_replay: PushSocket,
    params_pub: PubSocket,
    to_coordinator: PushSocket,
    batch_tx: Sender<SampledBatch>,
    priorities_rx: Receiver<PriorityUpdate>,
    params_rx: Receiver<ModelParameters>,
    stats_rx: Receiver<(u64, LogPayload)>,
}

impl LearnerIo {
    /// Pull one pending batch from the replay socket into the batch queue.
    ///
    /// With `blocking = false` this returns immediately when nothing is
    /// queued, letting the io loop drain everything pending before moving
    /// on. Malformed batches are dropped and logged, never fatal.
    pub fn recv_batch(&mut self, blocking: bool) -> Result<bool> {
        let envelope = if blocking {
            self.from_replay.recv_timeout(Duration::from_millis(100))?
        } else {
            self.from_replay.try_recv()?
        };

        let Some(envelope) = envelope else {
            return Ok(false);
        };
        match envelope {
            Envelope::Batch(batch) => {
                if !batch.is_consistent() {
                    log::warn!("dropping malformed batch ({} transitions)", batch.len());
                    return Ok(false);
                }
                match self.batch_tx.try_send(batch) {
                    Ok(()) => Ok(true),
                    Err(TrySendError::Full(_)) => {
                        // Optimize loop is behind; the replay server will
                        // resample, so shedding here is safe.
                        log::debug!("batch queue full; dropping batch");
                        Ok(false)
                    }
                    Err(TrySendError::Disconnected(_)) => Err(ApexError::UnexpectedMessage(
                        "optimize loop gone".into(),
                    )),
                }
            }
            other => {
                log::debug!("learner dropping unexpected {} packet", other.tag());
                Ok(false)
            }
        }
    }

    /// Forward any staged priority updates to the replay server.
    pub fn send_new_priorities(&mut self) -> bool {
        let mut sent = false;
        while let Ok(update) = self.priorities_rx.try_recv() {
            let envelope = Envelope::Priorities {
                ids: update.ids,
                priorities: update.priorities,
                sgd_step: update.sgd_step,
            };
            match self.to_replay.send(&envelope) {
                Ok(()) => sent = true,
                Err(e) => {
                    // Lost priorities self-heal through resampling.
                    log::warn!("priority send failed ({e})");
                    break;
                }
            }
        }
        sent
    }

    /// Broadcast any staged parameter snapshots to workers.
    pub fn publish_params(&mut self) -> bool {
        let mut published = false;
        while let Ok(params) = self.params_rx.try_recv() {
            let version = params.version;
            match self.params_pub.publish(&Envelope::Params(params)) {
                Ok(()) => {
                    log::debug!("published params version {version}");
                    published = true;
                }
                Err(e) => {
                    log::warn!("param broadcast failed ({e})");
                    break;
                }
            }
        }
        published
    }

    /// Forward staged log packets to the coordinator.
    pub fn forward_logs(&mut self) -> bool {
        let mut sent = false;
        while let Ok((step, payload)) = self.stats_rx.try_recv() {
            let envelope = Envelope::Log {
                sender: ActorId::Learner,
                step,
                payload,
            };
            if self.to_coordinator.send(&envelope).is_ok() {
                sent = true;
            }
        }
        sent
    }

    /// The io loop: cycles intake and all three outbound queues.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            let mut progressed = false;
            // Drain all pending batches before proceeding.
            while self.recv_batch(false)? {
                progressed = true;
            }
            progressed |= self.send_new_priorities();
            progressed |= self.publish_params();
            progressed |= self.forward_logs();

            if !progressed {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        Ok(())
    }
}

/// Compute half of the learner. Runs on the optimize thread.
pub struct LearnerCore<O: Optimizer> {
    optimizer: O,
    batch_rx: Receiver<SampledBatch>,
    priorities_tx: Sender<PriorityUpdate>,
    params_tx: Sender<ModelParameters>,
    stats_tx: Sender<(u64, LogPayload)>,
    version: VersionCounter,
    sgd_step: u64,
    publish_interval: u64,
    /// Loss stats accumulated since the last publish: key -> (sum, count).
    stats_acc: Vec<(String, f64, u64)>,
}

impl<O: Optimizer> LearnerCore<O> {
    /// Perform one optimization step if a batch is queued.
    ///
    /// Returns true when a step ran. New priorities are staged for the io
    /// loop; loss stats accumulate until the next publish.
    pub fn optimize_model(&mut self) -> bool {
        let Ok(batch) = self.batch_rx.try_recv() else {
            return false;
        };

        let outcome = self.optimizer.optimize(&batch);
        self.sgd_step += 1;

        if outcome.priorities.len() != batch.ids.len() {
            log::warn!(
                "optimizer returned {} priorities for {} samples; skipping update",
                outcome.priorities.len(),
                batch.ids.len()
            );
        } else if self
            .priorities_tx
            .send(PriorityUpdate {
                ids: batch.ids,
                priorities: outcome.priorities,
                sgd_step: self.sgd_step,
            })
            .is_err()
        {
            log::warn!("io loop gone; priority update dropped");
        }

        for (key, value) in outcome.stats {
            if !value.is_finite() {
                continue;
            }
            match self.stats_acc.iter_mut().find(|(k, _, _)| *k == key) {
                Some(entry) => {
                    entry.1 += value;
                    entry.2 += 1;
                }
                None => self.stats_acc.push((key, value, 1)),
            }
        }

        self.prepare_new_params_to_workers();
        true
    }

    /// Stage a parameter snapshot every `publish_interval` SGD steps.
    ///
    /// Staging is decoupled from broadcasting so the optimization cadence
    /// never waits on the network. The accumulated loss stats go out as a
    /// log packet keyed by the new version, which is also the step key the
    /// workers use when they apply it.
    pub fn prepare_new_params_to_workers(&mut self) {
        if self.publish_interval == 0 || self.sgd_step % self.publish_interval != 0 {
            return;
        }
        let version = self.version.increment();
        let params = ModelParameters::new(version, self.optimizer.export_params());
        if self.params_tx.send(params).is_err() {
            log::warn!("io loop gone; params version {version} dropped");
        }

        let averaged: Vec<(String, f64)> = self
            .stats_acc
            .drain(..)
            .map(|(key, sum, count)| (key, sum / count.max(1) as f64))
            .collect();
        let _ = self
            .stats_tx
            .send((version, LogPayload::training(averaged)));
    }

    /// SGD steps completed so far.
    pub fn sgd_step(&self) -> u64 {
        self.sgd_step
    }

    /// The optimize loop: keeps cycling regardless of batch availability.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Relaxed) {
            if !self.optimize_model() {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

/// The learner actor: io half plus compute half.
pub struct Learner<O: Optimizer> {
    pub io: LearnerIo,
    pub core: LearnerCore<O>,
}

impl<O: Optimizer> std::fmt::Debug for Learner<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Learner").finish_non_exhaustive()
    }
}

impl<O: Optimizer + 'static> Learner<O> {
    /// Bootstrap the learner.
    ///
    /// Binds the batch intake and the parameter broadcast, reports both to
    /// the coordinator, then blocks (bounded) until the replay server
    /// announces its priority intake over the batch channel.
    pub fn bootstrap(config: &ApexConfig, known: &EndpointMap, optimizer: O) -> Result<Self> {
        let timeout = Duration::from_secs(config.handshake_timeout_secs);
        let mut to_coordinator =
            PushSocket::connect_retry(known.require(Channel::CoordinatorLogs)?, timeout)?;

        let (mut from_replay, batch_port) = PullSocket::bind(config.min_port, config.port_range)?;
        let (params_pub, params_port) = PubSocket::bind(config.min_port, config.port_range)?;

        to_coordinator.send(&Envelope::Handshake {
            actor: ActorId::Learner,
            endpoints: vec![
                (Channel::ReplayToLearner, batch_port),
                (Channel::ParamsPubSub, params_port),
            ],
        })?;

        // The replay server sends its handshake over the batch channel
        // before any batches, so the first frame here names its ports.
        let replay_ports = match from_replay.recv_timeout(timeout)? {
            Some(Envelope::Handshake { endpoints, .. }) => endpoints,
            Some(other) => {
                return Err(ApexError::UnexpectedMessage(format!(
                    "expected replay handshake, got {}",
                    other.tag()
                )))
            }
            None => {
                return Err(ApexError::BootstrapTimeout {
                    actor: ActorId::ReplayServer.to_string(),
                    waited_secs: timeout.as_secs_f64(),
                })
            }
        };
        let mut replay_map = EndpointMap::new();
        replay_map.extend(&replay_ports);
        let to_replay =
            PushSocket::connect_retry(replay_map.require(Channel::LearnerToReplay)?, timeout)?;

        liveness::write_pid_file(config, ActorId::Learner)?;
        log::info!("learner bootstrapped: batches={batch_port} params={params_port}");

        let (batch_tx, batch_rx) = bounded(config.max_pending_batches.max(1));
        let (priorities_tx, priorities_rx) = bounded(config.max_pending_batches.max(1) * 2);
        let (params_tx, params_rx) = bounded(8);
        let (stats_tx, stats_rx) = bounded(256);

        Ok(Self {
            io: LearnerIo {
                from_replay,
                to_replay,
                params_pub,
                to_coordinator,
                batch_tx,
                priorities_rx,
                params_rx,
                stats_rx,
            },
            core: LearnerCore {
                optimizer,
                batch_rx,
                priorities_tx,
                params_tx,
                stats_tx,
                version: VersionCounter::new(),
                sgd_step: 0,
                publish_interval: config.param_publish_interval,
                stats_acc: Vec::new(),
            },
        })
    }

    /// Run both loops until `shutdown` is set. The optimize loop gets its
    /// own named thread; io runs on the caller's thread.
    pub fn run(self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let Learner { mut io, mut core } = self;

        let optimize_shutdown = shutdown.clone();
        let optimize_thread = std::thread::Builder::new()
            .name("learner-optimize".to_string())
            .spawn(move || core.run(&optimize_shutdown))
            .expect("failed to spawn optimize thread");

        let result = io.run(&shutdown);
        // Make sure the optimize thread also stops if io errored out.
        shutdown.store(true, Ordering::Relaxed);
        let _ = optimize_thread.join();
        result
    }
}
