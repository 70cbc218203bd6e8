//! Bully election bookkeeping

use std::collections::BTreeSet;
use serde::{Deserialize, Serialize};

use crate::state::PeerId;

/// Election phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionPhase {
    /// No election in progress
    Idle,
    /// Challenged higher peers, waiting for an announcement
    Electing,
}

/// Role derived from the known coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Coordinator,
    Follower,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Coordinator => write!(f, "COORDINATOR"),
            Role::Follower => write!(f, "FOLLOWER"),
        }
    }
}

#[derive(Debug)]
pub struct ElectionState {
    phase: ElectionPhase,
    /// Higher peers challenged in the current cycle
    higher_peers: BTreeSet<PeerId>,
    /// Higher peers that answered `ElectionOk`
    acknowledged: BTreeSet<PeerId>,
    coordinator: Option<PeerId>,
    /// Identifies the cycle a timer belongs to
    round: u64,
}

impl Default for ElectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ElectionState {
    pub fn new() -> Self {
        Self {
            phase: ElectionPhase::Idle,
            higher_peers: BTreeSet::new(),
            acknowledged: BTreeSet::new(),
            coordinator: None,
            round: 0,
        }
    }

    pub fn phase(&self) -> ElectionPhase {
        self.phase
    }

    pub fn is_electing(&self) -> bool {
        self.phase == ElectionPhase::Electing
    }

    pub fn coordinator(&self) -> Option<&PeerId> {
        self.coordinator.as_ref()
    }

    pub fn role(&self, local_id: &str) -> Role {
        if self.coordinator.as_deref() == Some(local_id) {
            Role::Coordinator
        } else {
            Role::Follower
        }
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn higher_peers(&self) -> &BTreeSet<PeerId> {
        &self.higher_peers
    }

    pub fn replies_received(&self) -> usize {
        self.acknowledged.len()
    }

    /// Start a new cycle against `higher`; returns its round
    pub fn begin(&mut self, higher: impl IntoIterator<Item = PeerId>) -> u64 {
        self.phase = ElectionPhase::Electing;
        self.higher_peers = higher.into_iter().collect();
        self.acknowledged.clear();
        self.round += 1;
        self.round
    }

    /// A challenged peer could not be reached
    pub fn drop_higher(&mut self, peer: &str) {
        self.higher_peers.remove(peer);
        self.acknowledged.remove(peer);
    }

    /// Count an acknowledgement; only higher peers of this cycle count
    pub fn acknowledge(&mut self, peer: &str) -> bool {
        if self.phase != ElectionPhase::Electing || !self.higher_peers.contains(peer) {
            return false;
        }
        self.acknowledged.insert(peer.to_string())
    }

    /// Every challenged peer acknowledged
    pub fn all_acknowledged(&self) -> bool {
        self.acknowledged.len() == self.higher_peers.len()
    }

    /// Adopt a coordinator and end the current cycle
    pub fn set_coordinator(&mut self, id: PeerId) {
        self.coordinator = Some(id);
        self.finish();
    }

    /// End the current cycle without a result
    pub fn finish(&mut self) {
        self.phase = ElectionPhase::Idle;
        self.higher_peers.clear();
        self.acknowledged.clear();
    }
}
