//! Learner tests: bootstrap over real sockets, the optimize/io split,
//! and malformed-batch tolerance.

use crate::config::ApexConfig;
use crate::core::Transition;
use crate::endpoints::{Channel, EndpointMap};
use crate::learner::optimizer::stub::StubOptimizer;
use crate::learner::Learner;
use crate::messages::{ActorId, Envelope, SampledBatch};
use crate::transport::{PullSocket, PushSocket, SubSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn test_config(dir: &std::path::Path) -> ApexConfig {
    ApexConfig::new()
        .with_port_window(26_000, 2_000)
        .with_run_dir(dir)
        .with_handshake_timeout_secs(10)
}

fn batch_of(rewards: &[f32], first_id: u64) -> SampledBatch {
    let n = rewards.len();
    SampledBatch {
        transitions: rewards
            .iter()
            .map(|&r| Transition::new(vec![r], 0, r, false, 1))
            .collect(),
        ids: (first_id..first_id + n as u64).collect(),
        probabilities: vec![1.0 / n as f32; n],
        weights: vec![1.0; n],
        sgd_step: 0,
    }
}

/// Stand-in for the replay server side of the learner's channels.
struct FakeReplay {
    to_learner: PushSocket,
    from_learner: PullSocket,
}

/// Boot a learner against a test-local coordinator socket and fake
/// replay server; returns the learner plus the fake peer ends.
fn bootstrap_learner(
    config: &ApexConfig,
) -> (Learner<StubOptimizer>, FakeReplay, PullSocket, SubSocket) {
    let (mut coordinator, coordinator_port) =
        PullSocket::bind(config.min_port, config.port_range).unwrap();

    let mut known = EndpointMap::new();
    known.insert(Channel::CoordinatorLogs, coordinator_port);

    let learner_thread = {
        let config = config.clone();
        let known = known.clone();
        std::thread::spawn(move || {
            Learner::bootstrap(&config, &known, StubOptimizer::new()).unwrap()
        })
    };

    // Coordinator side: wait for the learner's handshake report.
    let learner_ports = match coordinator
        .recv_timeout(Duration::from_secs(10))
        .unwrap()
        .expect("no learner handshake")
    {
        Envelope::Handshake { actor, endpoints } => {
            assert_eq!(actor, ActorId::Learner);
            endpoints
        }
        other => panic!("unexpected {other:?}"),
    };
    let mut learner_map = EndpointMap::new();
    learner_map.extend(&learner_ports);

    // Replay side: bind a priority intake, announce it over the batch
    // channel, exactly as the real replay server does.
    let (from_learner, priority_port) =
        PullSocket::bind(config.min_port, config.port_range).unwrap();
    let mut to_learner = PushSocket::connect_retry(
        learner_map.require(Channel::ReplayToLearner).unwrap(),
        Duration::from_secs(10),
    )
    .unwrap();
    to_learner
        .send(&Envelope::Handshake {
            actor: ActorId::ReplayServer,
            endpoints: vec![(Channel::LearnerToReplay, priority_port)],
        })
        .unwrap();

    let params_sub = SubSocket::connect_retry(
        learner_map.require(Channel::ParamsPubSub).unwrap(),
        Duration::from_secs(10),
    )
    .unwrap();

    let learner = learner_thread.join().unwrap();
    (
        learner,
        FakeReplay {
            to_learner,
            from_learner,
        },
        coordinator,
        params_sub,
    )
}

#[test]
fn test_bootstrap_and_full_cycle() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.param_publish_interval = 1;

    let (learner, mut replay, mut coordinator, mut params_sub) = bootstrap_learner(&config);

    let shutdown = Arc::new(AtomicBool::new(false));
    let learner_thread = {
        let shutdown = shutdown.clone();
        std::thread::spawn(move || learner.run(shutdown))
    };

    replay.to_learner.send(&Envelope::Batch(batch_of(&[2.0, 3.0], 0))).unwrap();

    // Priorities come back keyed by the batch ids: |reward| + 0.1.
    match replay
        .from_learner
        .recv_timeout(Duration::from_secs(10))
        .unwrap()
        .expect("no priorities returned")
    {
        Envelope::Priorities { ids, priorities, sgd_step } => {
            assert_eq!(ids, vec![0, 1]);
            assert_eq!(sgd_step, 1);
            assert!((priorities[0] - 2.1).abs() < 1e-6);
            assert!((priorities[1] - 3.1).abs() < 1e-6);
        }
        other => panic!("unexpected {other:?}"),
    }

    // With publish_interval = 1 a params broadcast follows immediately.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    let params = loop {
        if let Some(Envelope::Params(p)) = params_sub.latest().unwrap() {
            break p;
        }
        assert!(std::time::Instant::now() < deadline, "params never arrived");
        std::thread::sleep(Duration::from_millis(2));
    };
    assert_eq!(params.version, 1);
    assert_eq!(params.values, vec![1.0]);

    // The coordinator gets a log packet for sgd step 1.
    match coordinator
        .recv_timeout(Duration::from_secs(10))
        .unwrap()
        .expect("no log packet")
    {
        Envelope::Log { sender, step, payload } => {
            assert_eq!(sender, ActorId::Learner);
            assert_eq!(step, 1);
            assert_eq!(payload.training.len(), 1);
        }
        other => panic!("unexpected {other:?}"),
    }

    shutdown.store(true, Ordering::Relaxed);
    learner_thread.join().unwrap().unwrap();
}

#[test]
fn test_malformed_batch_dropped_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.param_publish_interval = 1;

    let (learner, mut replay, _coordinator, _params_sub) = bootstrap_learner(&config);

    let shutdown = Arc::new(AtomicBool::new(false));
    let learner_thread = {
        let shutdown = shutdown.clone();
        std::thread::spawn(move || learner.run(shutdown))
    };

    // ids array disagrees with the transitions: must be dropped.
    let mut malformed = batch_of(&[1.0], 0);
    malformed.ids.clear();
    replay.to_learner.send(&Envelope::Batch(malformed)).unwrap();

    // A healthy batch afterwards still gets processed.
    replay.to_learner.send(&Envelope::Batch(batch_of(&[5.0], 7))).unwrap();
    match replay
        .from_learner
        .recv_timeout(Duration::from_secs(10))
        .unwrap()
        .expect("learner stopped cycling after malformed batch")
    {
        Envelope::Priorities { ids, sgd_step, .. } => {
            assert_eq!(ids, vec![7]);
            // The malformed batch never became an SGD step.
            assert_eq!(sgd_step, 1);
        }
        other => panic!("unexpected {other:?}"),
    }

    shutdown.store(true, Ordering::Relaxed);
    learner_thread.join().unwrap().unwrap();
}

#[test]
fn test_bootstrap_times_out_without_replay() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path()).with_handshake_timeout_secs(1);

    let (mut coordinator, coordinator_port) =
        PullSocket::bind(config.min_port, config.port_range).unwrap();
    let mut known = EndpointMap::new();
    known.insert(Channel::CoordinatorLogs, coordinator_port);

    let result = std::thread::spawn({
        let config = config.clone();
        move || Learner::bootstrap(&config, &known, StubOptimizer::new())
    })
    .join()
    .unwrap();

    // The handshake report still went out; the replay wait then expired.
    assert!(coordinator
        .recv_timeout(Duration::from_secs(5))
        .unwrap()
        .is_some());
    match result {
        Err(crate::error::ApexError::BootstrapTimeout { actor, .. }) => {
            assert_eq!(actor, "replay_server");
        }
        other => panic!("expected BootstrapTimeout, got {other:?}"),
    }
}
