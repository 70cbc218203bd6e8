//! Logical clock and request tickets

use serde::{Deserialize, Serialize};

use super::PeerId;

/// Lamport clock used to order critical-section requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogicalClock {
    value: u64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value
    pub fn now(&self) -> u64 {
        self.value
    }

    /// Advance for a local send event
    pub fn tick(&mut self) -> u64 {
        self.value += 1;
        self.value
    }

    /// Advance past a timestamp received from a peer
    pub fn observe(&mut self, received: u64) -> u64 {
        self.value = self.value.max(received) + 1;
        self.value
    }
}

/// Priority of a critical-section request. Smaller wins: timestamp first,
/// requester id breaks ties.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ticket {
    pub timestamp: u64,
    pub requester: PeerId,
}

impl Ticket {
    pub fn new(timestamp: u64, requester: impl Into<PeerId>) -> Self {
        Self {
            timestamp,
            requester: requester.into(),
        }
    }
}

impl std::fmt::Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.timestamp, self.requester)
    }
}
