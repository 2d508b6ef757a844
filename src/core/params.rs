//! Versioned policy parameter snapshots.
//!
//! The learner broadcasts `ModelParameters` to workers; a worker keeps only
//! the latest version it has received. The version counter is monotone and
//! owned by the learner's optimize loop.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A flat snapshot of the policy, tagged with its version.
///
/// The parameter blob is opaque to the coordination layer; only the
/// external optimizer and environment interpret it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    /// Monotonically increasing snapshot version.
    pub version: u64,
    /// Flattened parameter values.
    pub values: Vec<f32>,
}

impl ModelParameters {
    /// Create a snapshot.
    pub fn new(version: u64, values: Vec<f32>) -> Self {
        Self { version, values }
    }

    /// True if `other` supersedes this snapshot.
    pub fn is_older_than(&self, other: &ModelParameters) -> bool {
        self.version < other.version
    }
}

/// Thread-safe monotone version counter.
///
/// Shared between the learner's optimize loop (which increments on every
/// publish) and its io loop (which stamps outgoing snapshots).
#[derive(Debug, Default)]
pub struct VersionCounter {
    version: AtomicU64,
}

impl VersionCounter {
    /// Create a counter starting at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment and return the new version.
    pub fn increment(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current version without incrementing.
    pub fn current(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}
