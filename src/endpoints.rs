//! Endpoint registry: free-port allocation and endpoint map persistence.
//!
//! Every communication channel in the pipeline is identified by a
//! [`Channel`] tag and bound to a localhost TCP port negotiated at
//! bootstrap. The full map is written to the run directory once, so a
//! restarted actor can reconnect without re-running the handshake.
//!
//! Ports are validated only by binding; later connect failures are a
//! transport concern, not this module's.

use crate::error::{ApexError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::Path;

/// Logical communication channels of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// All actors -> coordinator: log packets and handshake reports.
    CoordinatorLogs,
    /// Replay server -> learner: sampled batches.
    ReplayToLearner,
    /// Learner -> replay server: updated priorities.
    LearnerToReplay,
    /// Workers -> replay server: raw transitions.
    WorkersToReplay,
    /// Learner -> workers broadcast: parameter snapshots.
    ParamsPubSub,
    /// Replay server -> workers broadcast: data-kind requests.
    DataRequestPubSub,
}

impl Channel {
    /// Stable name used in the persisted map and log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Channel::CoordinatorLogs => "coordinator_logs",
            Channel::ReplayToLearner => "replay_to_learner",
            Channel::LearnerToReplay => "learner_to_replay",
            Channel::WorkersToReplay => "workers_to_replay",
            Channel::ParamsPubSub => "params_pubsub",
            Channel::DataRequestPubSub => "data_request_pubsub",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable snapshot mapping channels to bound localhost ports.
///
/// Created once per run during bootstrap, persisted to
/// `run_dir/endpoints.json`, and only replaced by a full reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointMap {
    ports: BTreeMap<Channel, u16>,
}

impl EndpointMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a channel's port. Later inserts for the same channel win;
    /// bootstrap assigns each channel exactly once.
    pub fn insert(&mut self, channel: Channel, port: u16) {
        self.ports.insert(channel, port);
    }

    /// Look up a channel's port.
    pub fn port(&self, channel: Channel) -> Option<u16> {
        self.ports.get(&channel).copied()
    }

    /// Look up a channel's full socket address (always loopback).
    pub fn addr(&self, channel: Channel) -> Option<SocketAddr> {
        self.port(channel)
            .map(|p| SocketAddr::from((Ipv4Addr::LOCALHOST, p)))
    }

    /// Require a channel, with a descriptive error when absent.
    pub fn require(&self, channel: Channel) -> Result<SocketAddr> {
        self.addr(channel).ok_or_else(|| {
            ApexError::UnexpectedMessage(format!("endpoint map has no entry for {channel}"))
        })
    }

    /// Merge reported `(channel, port)` pairs from a handshake packet.
    pub fn extend(&mut self, pairs: &[(Channel, u16)]) {
        for &(channel, port) in pairs {
            self.insert(channel, port);
        }
    }

    /// Number of recorded channels.
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// True when no channel is recorded.
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Iterate over `(channel, port)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Channel, u16)> + '_ {
        self.ports.iter().map(|(&c, &p)| (c, p))
    }

    /// Persist the map as JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| ApexError::Checkpoint(e.to_string()))?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Load a persisted map. Missing file yields [`ApexError::EndpointsMissing`].
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ApexError::EndpointsMissing {
                    path: path.display().to_string(),
                }
            } else {
                ApexError::Transport(e)
            }
        })?;
        serde_json::from_str(&raw).map_err(|e| ApexError::Codec(e.to_string()))
    }
}

/// Bind a listener to a free port inside `[min_port, min_port + range)`.
///
/// Returns the bound listener along with its port so the caller can hand
/// the listener straight to a socket without a rebind race.
pub fn allocate_port(min_port: u16, range: u16) -> Result<(TcpListener, u16)> {
    let max_port = min_port.saturating_add(range);
    for port in min_port..max_port {
        match TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))) {
            Ok(listener) => return Ok((listener, port)),
            Err(_) => continue,
        }
    }
    Err(ApexError::PortExhaustion { min_port, max_port })
}
