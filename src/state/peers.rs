//! Peer Table
//!
//! The authoritative "who do I talk to" set, shared by mutual exclusion,
//! failure detection and election.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use super::PeerId;

/// A known remote peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Unique peer identifier
    pub id: PeerId,
    /// Address used to issue calls (host:port)
    pub address: String,
    /// Last heartbeat, or discovery time if none arrived yet
    pub last_heartbeat: Instant,
    /// When this peer was first seen
    pub discovered_at: chrono::DateTime<chrono::Utc>,
}

impl PeerRecord {
    pub fn new(id: PeerId, address: String, now: Instant) -> Self {
        Self {
            id,
            address,
            last_heartbeat: now,
            discovered_at: chrono::Utc::now(),
        }
    }

    /// Check whether the peer has been silent for longer than `timeout`
    pub fn is_stale(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_heartbeat) > timeout
    }
}

/// Mapping from peer id to record; never contains the local node
#[derive(Debug)]
pub struct PeerTable {
    local_id: PeerId,
    peers: HashMap<PeerId, PeerRecord>,
    /// Evicted for silence; only a heartbeat brings them back
    evicted: HashSet<PeerId>,
}

impl PeerTable {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            peers: HashMap::new(),
            evicted: HashSet::new(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Insert a peer if unknown, refreshing the address otherwise.
    /// Returns true when the peer is new.
    pub fn upsert(&mut self, id: &str, address: &str, now: Instant) -> bool {
        if id == self.local_id {
            return false;
        }

        match self.peers.get_mut(id) {
            Some(record) => {
                if record.address != address {
                    tracing::debug!("Peer {} moved {} -> {}", id, record.address, address);
                    record.address = address.to_string();
                }
                false
            }
            None => {
                self.peers.insert(
                    id.to_string(),
                    PeerRecord::new(id.to_string(), address.to_string(), now),
                );
                true
            }
        }
    }

    /// Directory-driven insert. Peers evicted for silence stay out until
    /// they send a heartbeat, whatever the directory still lists.
    pub fn admit(&mut self, id: &str, address: &str, now: Instant) -> bool {
        if self.evicted.contains(id) {
            return false;
        }
        self.upsert(id, address, now)
    }

    /// Record a heartbeat, inserting the sender if unknown.
    /// Returns true when the sender is new.
    pub fn record_heartbeat(&mut self, id: &str, address: &str, now: Instant) -> bool {
        self.evicted.remove(id);
        let inserted = self.upsert(id, address, now);
        if let Some(record) = self.peers.get_mut(id) {
            record.last_heartbeat = now;
        }
        inserted
    }

    pub fn remove(&mut self, id: &str) -> Option<PeerRecord> {
        self.peers.remove(id)
    }

    /// Remove a silent peer and keep it out of directory refreshes
    pub fn evict(&mut self, id: &str) -> Option<PeerRecord> {
        let record = self.peers.remove(id)?;
        self.evicted.insert(record.id.clone());
        Some(record)
    }

    pub fn is_evicted(&self, id: &str) -> bool {
        self.evicted.contains(id)
    }

    /// Forget evictions of peers the directory no longer lists
    pub fn retain_evicted(&mut self, mut listed: impl FnMut(&str) -> bool) {
        self.evicted.retain(|id| listed(id.as_str()));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    pub fn address_of(&self, id: &str) -> Option<String> {
        self.peers.get(id).map(|r| r.address.clone())
    }

    /// (id, address) pairs, sorted by id
    pub fn snapshot(&self) -> Vec<(PeerId, String)> {
        let mut peers: Vec<_> = self
            .peers
            .values()
            .map(|r| (r.id.clone(), r.address.clone()))
            .collect();
        peers.sort();
        peers
    }

    /// Sorted peer ids
    pub fn ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<_> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Peers whose id outranks `id`
    pub fn higher_than(&self, id: &str) -> Vec<(PeerId, String)> {
        self.snapshot()
            .into_iter()
            .filter(|(peer, _)| peer.as_str() > id)
            .collect()
    }

    /// Peers silent for longer than `timeout`
    pub fn stale(&self, timeout: Duration, now: Instant) -> Vec<PeerId> {
        let mut stale: Vec<_> = self
            .peers
            .values()
            .filter(|r| r.is_stale(timeout, now))
            .map(|r| r.id.clone())
            .collect();
        stale.sort();
        stale
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
