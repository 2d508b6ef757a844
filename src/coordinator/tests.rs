//! Coordinator tests: step aggregation semantics, run-state persistence,
//! restart preconditions, and the full bootstrap handshake end-to-end
//! over real sockets.

use crate::config::ApexConfig;
use crate::coordinator::{Coordinator, Launcher, PacketOutcome, RunState, StepAggregator};
use crate::endpoints::EndpointMap;
use crate::environment::stub::StubEnvironment;
use crate::error::ApexError;
use crate::learner::optimizer::stub::StubOptimizer;
use crate::learner::Learner;
use crate::messages::{ActorId, EvalRecord, LogPayload};
use crate::metrics::MemorySink;
use crate::replay::ReplayServer;
use crate::worker::Worker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn training(loss: f64) -> LogPayload {
    LogPayload::training(vec![("loss".into(), loss)])
}

fn two_workers_and_learner() -> StepAggregator {
    StepAggregator::new(
        vec![ActorId::Worker(1), ActorId::Worker(2), ActorId::Learner],
        50,
        "objective",
    )
}

#[test]
fn test_out_of_order_steps_flush_in_step_order() {
    let mut agg = StepAggregator::new(
        vec![ActorId::Worker(1), ActorId::Worker(2)],
        50,
        "objective",
    );

    // Steps 5, 6, 7 arrive interleaved and out of order across senders.
    agg.ingest(ActorId::Worker(1), 6, training(0.6));
    agg.ingest(ActorId::Worker(2), 5, training(0.5));
    agg.ingest(ActorId::Worker(1), 7, training(0.7));
    assert!(agg.finished_steps().is_empty(), "worker 2 still at step 5");

    agg.ingest(ActorId::Worker(2), 7, training(0.7));

    let flushed = agg.finished_steps();
    let steps: Vec<u64> = flushed.iter().map(|f| f.step).collect();
    assert_eq!(steps, vec![5, 6, 7]);
    assert!(flushed.iter().all(|f| !f.forced));
}

#[test]
fn test_flush_gated_on_slowest_actor() {
    let mut agg = two_workers_and_learner();

    // Both workers report step 10; the learner is only at 9.
    agg.ingest(ActorId::Worker(1), 10, training(1.0));
    agg.ingest(ActorId::Worker(2), 10, training(2.0));
    agg.ingest(ActorId::Learner, 9, training(0.9));
    let early = agg.finished_steps();
    let steps: Vec<u64> = early.iter().map(|f| f.step).collect();
    assert_eq!(steps, vec![9], "step 10 must wait for the learner");

    // Learner reaches 10: the step flushes atomically, averaged.
    agg.ingest(ActorId::Learner, 10, training(3.0));
    let flushed = agg.finished_steps();
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].step, 10);
    let loss = flushed[0]
        .metrics
        .iter()
        .find(|(k, _)| k == "training/loss")
        .unwrap()
        .1;
    assert!((loss - 2.0).abs() < 1e-9, "mean of 1, 2, 3");
}

#[test]
fn test_stale_packet_dropped_without_mutating_history() {
    let mut agg = StepAggregator::new(vec![ActorId::Worker(1)], 50, "objective");

    agg.ingest(ActorId::Worker(1), 3, training(0.3));
    assert_eq!(agg.finished_steps().len(), 1);
    assert_eq!(agg.last_logging_step(), 3);

    // Step 2 from an untracked sender is behind the flush cursor.
    let outcome = agg.ingest(ActorId::Tester, 2, training(9.9));
    assert_eq!(outcome, PacketOutcome::Stale);
    assert_eq!(agg.backlog(), 0, "stale packet must not be buffered");
}

#[test]
fn test_non_monotonic_sender_rejected() {
    let mut agg = StepAggregator::new(vec![ActorId::Worker(1), ActorId::Worker(2)], 50, "objective");

    agg.ingest(ActorId::Worker(1), 5, training(0.5));
    let outcome = agg.ingest(ActorId::Worker(1), 5, training(0.5));
    assert_eq!(outcome, PacketOutcome::NonMonotonic);
    let outcome = agg.ingest(ActorId::Worker(1), 4, training(0.4));
    assert_eq!(outcome, PacketOutcome::NonMonotonic);
}

#[test]
fn test_forced_flush_names_laggard() {
    let mut agg = StepAggregator::new(
        vec![ActorId::Worker(1), ActorId::Worker(2)],
        5,
        "objective",
    );

    // Worker 2 is dead; worker 1 keeps reporting.
    for step in 1..=6 {
        agg.ingest(ActorId::Worker(1), step, training(step as f64));
    }
    // Backlog of 6 exceeds the bound of 5: oldest step force-flushes.
    let flushed = agg.finished_steps();
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].step, 1);
    assert!(flushed[0].forced);
    assert_eq!(flushed[0].laggards, vec![ActorId::Worker(2)]);
    assert_eq!(agg.backlog(), 5);
}

#[test]
fn test_validation_records_averaged_per_dataset() {
    let mut agg = StepAggregator::new(vec![ActorId::Worker(1)], 50, "objective");

    let records = vec![
        EvalRecord {
            dataset: "valid_a".into(),
            instance: 0,
            seed: 1,
            metrics: vec![("objective".into(), 0.8)],
        },
        EvalRecord {
            dataset: "valid_a".into(),
            instance: 1,
            seed: 2,
            metrics: vec![("objective".into(), 0.4)],
        },
    ];
    agg.ingest(ActorId::Tester, 2, LogPayload::validation(records));
    agg.ingest(ActorId::Worker(1), 2, training(0.1));

    let flushed = agg.finished_steps();
    assert_eq!(flushed.len(), 1);
    let objective = flushed[0]
        .metrics
        .iter()
        .find(|(k, _)| k == "valid_a/objective")
        .unwrap()
        .1;
    assert!((objective - 0.6).abs() < 1e-9);
    assert_eq!(flushed[0].objectives, vec![("valid_a".to_string(), 0.6)]);
}

#[test]
fn test_run_state_round_trip_and_corrupt_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coordinator_state.json");

    let mut state = RunState::default();
    state.step_counter.insert("worker_1".into(), 12);
    state.last_logging_step = 11;
    state.best_performance.insert("valid_a".into(), 0.75);
    state.save(&path).unwrap();

    let loaded = RunState::load_or_default(&path);
    assert_eq!(loaded.step_counter["worker_1"], 12);
    assert_eq!(loaded.last_logging_step, 11);
    assert_eq!(loaded.best_performance["valid_a"], 0.75);

    std::fs::write(&path, "{ not json").unwrap();
    let fallback = RunState::load_or_default(&path);
    assert_eq!(fallback.last_logging_step, -1);
    assert!(fallback.step_counter.is_empty());
}

struct NoopLauncher;

impl Launcher for NoopLauncher {
    fn launch(&mut self, _: ActorId, _: &ApexConfig, _: &EndpointMap) -> crate::error::Result<()> {
        Ok(())
    }
}

#[test]
fn test_restart_without_endpoint_map_is_descriptive_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = ApexConfig::new().with_run_dir(dir.path());

    let err = Coordinator::restart_actors(&config, &mut NoopLauncher, &[ActorId::Learner], false)
        .unwrap_err();
    match err {
        ApexError::EndpointsMissing { path } => assert!(path.contains("endpoints.json")),
        other => panic!("expected EndpointsMissing, got {other}"),
    }
}

#[test]
fn test_restart_live_actor_requires_force() {
    let dir = tempfile::tempdir().unwrap();
    let config = ApexConfig::new().with_run_dir(dir.path());
    EndpointMap::new().save(&config.endpoints_path()).unwrap();

    // Record this test process as the "running" learner.
    crate::coordinator::liveness::write_pid_file(&config, ActorId::Learner).unwrap();

    let err = Coordinator::restart_actors(&config, &mut NoopLauncher, &[ActorId::Learner], false)
        .unwrap_err();
    assert!(matches!(err, ApexError::ActorAlive { .. }));
}

#[test]
fn test_reattach_restores_counters_from_run_state() {
    let dir = tempfile::tempdir().unwrap();
    let config = ApexConfig::new()
        .with_num_workers(1)
        .with_port_window(29_000, 500)
        .with_run_dir(dir.path());

    // A prior run left an endpoint map and a checkpointed state behind.
    let port = {
        let (listener, port) = crate::endpoints::allocate_port(29_000, 500).unwrap();
        drop(listener);
        port
    };
    let mut endpoints = EndpointMap::new();
    endpoints.insert(crate::endpoints::Channel::CoordinatorLogs, port);
    endpoints.save(&config.endpoints_path()).unwrap();

    let mut state = RunState::default();
    state.step_counter.insert("worker_1".into(), 8);
    state.step_counter.insert("learner".into(), 9);
    state.last_logging_step = 8;
    state.save(&config.run_state_path()).unwrap();

    let coordinator = Coordinator::reattach(config, Box::new(MemorySink::new())).unwrap();
    assert_eq!(coordinator.aggregator().last_logging_step(), 8);
    let counters = coordinator.aggregator().counters();
    assert!(counters.contains(&(ActorId::Worker(1), 8)));
    assert!(counters.contains(&(ActorId::Learner, 9)));
}

/// Thread-backed stand-in for the external actor-lifecycle manager.
struct ThreadLauncher {
    shutdown: Arc<AtomicBool>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl ThreadLauncher {
    fn new(shutdown: Arc<AtomicBool>) -> Self {
        Self {
            shutdown,
            handles: Vec::new(),
        }
    }

    fn join_all(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

impl Launcher for ThreadLauncher {
    fn launch(
        &mut self,
        actor: ActorId,
        config: &ApexConfig,
        known: &EndpointMap,
    ) -> crate::error::Result<()> {
        let config = config.clone();
        let known = known.clone();
        let shutdown = self.shutdown.clone();
        let handle = std::thread::Builder::new()
            .name(actor.to_string())
            .spawn(move || match actor {
                ActorId::Learner => {
                    let learner =
                        Learner::bootstrap(&config, &known, StubOptimizer::new()).unwrap();
                    learner.run(shutdown).unwrap();
                }
                ActorId::ReplayServer => {
                    let mut server = ReplayServer::bootstrap(config, &known, false).unwrap();
                    server.run(&shutdown).unwrap();
                }
                ActorId::Worker(_) | ActorId::Tester => {
                    let mut worker =
                        Worker::bootstrap(&config, &known, actor, StubEnvironment::new(4))
                            .unwrap();
                    worker.run(&shutdown).unwrap();
                }
                ActorId::Coordinator => unreachable!("coordinator launches itself"),
            })
            .expect("failed to spawn actor thread");
        self.handles.push(handle);
        Ok(())
    }
}

#[test]
fn test_full_pipeline_bootstrap_and_steady_state() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let mut config = ApexConfig::new()
        .with_num_workers(2)
        .with_replay_capacity(1_000)
        .with_min_replay_size(8)
        .with_batch_size(2)
        .with_port_window(28_000, 2_000)
        .with_run_dir(dir.path())
        .with_handshake_timeout_secs(20);
    config.local_buffer_size = 4;
    config.param_publish_interval = 1;
    config.max_pending_batches = 2;

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut launcher = ThreadLauncher::new(shutdown.clone());

    let sink = MemorySink::new();
    let flushed = sink.handle();
    let mut coordinator =
        Coordinator::setup(config.clone(), &mut launcher, Box::new(sink), false).unwrap();

    // The handshake persisted a complete endpoint map.
    let persisted = EndpointMap::load(&config.endpoints_path()).unwrap();
    assert_eq!(persisted.len(), 6, "all six channels negotiated");
    assert_eq!(persisted, *coordinator.endpoints());

    // Every actor recorded its pid during bootstrap.
    for actor in ["learner", "replay_server", "worker_1", "worker_2", "tester"] {
        assert!(
            config.pid_path(actor).exists(),
            "missing pid file for {actor}"
        );
    }

    // Drive the aggregation loop until at least two steps have flushed:
    // workers ship transitions, the learner optimizes and publishes, log
    // packets converge on the coordinator.
    let deadline = Instant::now() + Duration::from_secs(60);
    while flushed.lock().len() < 2 {
        if !coordinator.poll_once().unwrap() {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(
            Instant::now() < deadline,
            "pipeline produced no flushed steps"
        );
    }

    shutdown.store(true, Ordering::Relaxed);
    launcher.join_all();

    let steps = flushed.lock();
    assert!(steps.len() >= 2);
    // Steps flush in strictly increasing order.
    for pair in steps.windows(2) {
        assert!(pair[0].0 < pair[1].0);
    }
    // The learner's averaged loss made it into the flushed metrics.
    assert!(steps
        .iter()
        .any(|(_, metrics)| metrics.iter().any(|(k, _)| k == "training/loss")));

    // The run-state checkpoint tracked the flush cursor.
    let state = RunState::load_or_default(&config.run_state_path());
    assert_eq!(state.last_logging_step, steps.last().unwrap().0 as i64);
}
