//! Worker-side accumulation buffer.
//!
//! Collects self-generated transitions until a shipment is ready for the
//! replay server. Single-owner; no locking.

use crate::core::Transition;

/// Fixed-size staging buffer for outgoing replay data.
#[derive(Debug)]
pub struct LocalBuffer {
    items: Vec<Transition>,
    target_size: usize,
}

impl LocalBuffer {
    /// Create a buffer that is "full" at `target_size` entries.
    pub fn new(target_size: usize) -> Self {
        Self {
            items: Vec::with_capacity(target_size),
            target_size,
        }
    }

    /// Add one transition.
    pub fn push(&mut self, transition: Transition) {
        self.items.push(transition);
    }

    /// Add many transitions.
    pub fn extend(&mut self, transitions: impl IntoIterator<Item = Transition>) {
        self.items.extend(transitions);
    }

    /// Number of staged transitions.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// True once the shipment threshold is reached.
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.target_size
    }

    /// Drain all staged transitions, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<Transition> {
        std::mem::take(&mut self.items)
    }

    /// Drop everything staged (used when the data kind switches and
    /// already-collected transitions are no longer wanted).
    pub fn clear(&mut self) {
        self.items.clear();
    }
}
