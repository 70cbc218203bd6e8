//! Ricart–Agrawala bookkeeping
//!
//! Pure state machine; no I/O happens here. [`super::MutexCoordinator`]
//! drives it under the node-wide lock.

use std::collections::{BTreeSet, VecDeque};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::{PeerId, Ticket};

/// Critical-section state of the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Not interested in the resource
    Released,
    /// Waiting for permission
    Wanted,
    /// Inside the critical section
    Held,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Released => write!(f, "RELEASED"),
            NodeState::Wanted => write!(f, "WANTED"),
            NodeState::Held => write!(f, "HELD"),
        }
    }
}

/// What to do with an incoming request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Reply now
    Grant,
    /// Queue until release
    Defer,
}

#[derive(Debug)]
pub struct MutexState {
    state: NodeState,
    /// Ticket of the outstanding or held request
    ticket: Option<Ticket>,
    /// Peers whose reply is still missing
    awaiting: BTreeSet<PeerId>,
    /// Peers asked in the current round
    required: usize,
    /// Replies counted in the current round
    replies: usize,
    deferred: VecDeque<Ticket>,
    /// Bumped on every entry, identifies one hold
    epoch: u64,
}

impl Default for MutexState {
    fn default() -> Self {
        Self::new()
    }
}

impl MutexState {
    pub fn new() -> Self {
        Self {
            state: NodeState::Released,
            ticket: None,
            awaiting: BTreeSet::new(),
            required: 0,
            replies: 0,
            deferred: VecDeque::new(),
            epoch: 0,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn ticket(&self) -> Option<&Ticket> {
        self.ticket.as_ref()
    }

    pub fn awaiting(&self) -> &BTreeSet<PeerId> {
        &self.awaiting
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn replies(&self) -> usize {
        self.replies
    }

    pub fn deferred(&self) -> impl Iterator<Item = &Ticket> {
        self.deferred.iter()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn invalid(&self, operation: &'static str) -> Error {
        Error::InvalidStateTransition {
            operation,
            state: self.state.to_string(),
        }
    }

    /// RELEASED -> WANTED, waiting on every peer in `peers`
    pub fn begin(&mut self, ticket: Ticket, peers: impl IntoIterator<Item = PeerId>) -> Result<()> {
        if self.state != NodeState::Released {
            return Err(self.invalid("request the critical section"));
        }
        self.state = NodeState::Wanted;
        self.ticket = Some(ticket);
        self.awaiting = peers.into_iter().collect();
        self.required = self.awaiting.len();
        self.replies = 0;
        Ok(())
    }

    /// Apply the defer rule to an incoming request
    pub fn decide(&mut self, incoming: &Ticket) -> Decision {
        let defer = match self.state {
            NodeState::Held => true,
            NodeState::Wanted => self.ticket.as_ref().is_some_and(|own| own < incoming),
            NodeState::Released => false,
        };

        if !defer {
            return Decision::Grant;
        }
        if !self.deferred.contains(incoming) {
            self.deferred.push_back(incoming.clone());
        }
        Decision::Defer
    }

    /// Count a reply; returns false for stale or unexpected replies
    pub fn record_reply(&mut self, from: &str, timestamp: u64) -> bool {
        if self.state != NodeState::Wanted {
            return false;
        }
        if self.ticket.as_ref().map(|t| t.timestamp) != Some(timestamp) {
            return false;
        }
        if self.awaiting.remove(from) {
            self.replies += 1;
            true
        } else {
            false
        }
    }

    /// Stop waiting on a peer that could not be reached
    pub fn exclude(&mut self, peer: &str) -> bool {
        self.awaiting.remove(peer)
    }

    /// Every still-live peer has replied
    pub fn is_satisfied(&self) -> bool {
        self.awaiting.is_empty()
    }

    /// WANTED -> HELD; returns the epoch of this hold
    pub fn enter(&mut self) -> Result<u64> {
        if self.state != NodeState::Wanted {
            return Err(self.invalid("enter the critical section"));
        }
        self.state = NodeState::Held;
        self.awaiting.clear();
        self.epoch += 1;
        Ok(self.epoch)
    }

    /// HELD -> RELEASED; returns the deferred requests in arrival order
    pub fn release(&mut self) -> Result<Vec<Ticket>> {
        if self.state != NodeState::Held {
            return Err(self.invalid("release the critical section"));
        }
        Ok(self.reset())
    }

    /// WANTED -> RELEASED without entering; returns the deferred requests
    pub fn abandon(&mut self) -> Result<Vec<Ticket>> {
        if self.state != NodeState::Wanted {
            return Err(self.invalid("abandon a request"));
        }
        Ok(self.reset())
    }

    fn reset(&mut self) -> Vec<Ticket> {
        self.state = NodeState::Released;
        self.ticket = None;
        self.awaiting.clear();
        self.deferred.drain(..).collect()
    }

    /// Drop every trace of an evicted peer
    pub fn forget_peer(&mut self, peer: &str) -> bool {
        let was_awaited = self.awaiting.remove(peer);
        let before = self.deferred.len();
        self.deferred.retain(|t| t.requester != peer);
        was_awaited || self.deferred.len() != before
    }
}
