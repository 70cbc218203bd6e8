//! Coordinator Election
//!
//! Implements the Bully algorithm: the highest live id always ends up as
//! coordinator. A node that believes the coordinator is gone challenges every
//! higher peer; any of them that answers takes the election over.

mod state;

pub use state::{ElectionPhase, ElectionState, Role};

use std::sync::Arc;
use std::time::Duration;

use crate::network::PeerLink;
use crate::protocol::Message;
use crate::state::{PeerId, Shared, SharedState};

/// Election configuration
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// How long to wait for a coordinator announcement after challenging
    /// higher peers
    pub election_timeout: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_secs(3),
        }
    }
}

/// What an expired election timer leads to
enum TimeoutOutcome {
    Stale,
    Restart,
    Announce(Vec<(PeerId, String)>),
}

/// Election coordinator manages coordinator election
pub struct ElectionCoordinator {
    shared: SharedState,
    link: Arc<PeerLink>,
    config: ElectionConfig,
}

impl ElectionCoordinator {
    /// Create a new election coordinator
    pub fn new(shared: SharedState, link: Arc<PeerLink>, config: ElectionConfig) -> Self {
        Self {
            shared,
            link,
            config,
        }
    }

    /// Currently known coordinator
    pub async fn coordinator(&self) -> Option<PeerId> {
        self.shared.lock().await.election.coordinator().cloned()
    }

    pub async fn role(&self) -> Role {
        self.shared.lock().await.election.role(self.link.local_id())
    }

    pub async fn phase(&self) -> ElectionPhase {
        self.shared.lock().await.election.phase()
    }

    /// Challenge every higher peer, or take over when there is none.
    /// A no-op while an election is already running.
    pub async fn initiate_election(self: &Arc<Self>) {
        let local_id = self.link.local_id().to_string();

        let (round, targets) = {
            let mut shared = self.shared.lock().await;
            if shared.election.is_electing() {
                tracing::debug!("Election already in progress, not starting another");
                return;
            }

            let higher = shared.peers.higher_than(&local_id);
            if higher.is_empty() {
                let targets = claim(&mut shared, &local_id);
                drop(shared);
                self.announce(targets).await;
                return;
            }

            let round = shared.election.begin(higher.iter().map(|(id, _)| id.clone()));
            (round, higher)
        };

        tracing::info!(
            "Starting election round {} against {} higher peers",
            round,
            targets.len()
        );

        let challenge = Message::StartElection {
            sender_id: local_id.clone(),
        };
        let results = self.link.broadcast(&targets, challenge).await;

        let announce = {
            let mut shared = self.shared.lock().await;
            if !shared.election.is_electing() || shared.election.round() != round {
                // Settled while the challenges were in flight
                return;
            }
            for (id, result) in &results {
                if let Err(e) = result {
                    tracing::debug!("Higher peer {} unreachable: {}", id, e);
                    shared.election.drop_higher(id);
                }
            }
            if shared.election.higher_peers().is_empty() {
                Some(claim(&mut shared, &local_id))
            } else {
                None
            }
        };

        match announce {
            Some(targets) => {
                tracing::info!("No higher peer reachable");
                self.announce(targets).await;
            }
            None => self.arm_timer(round),
        }
    }

    /// Handle a challenge from `sender`
    pub async fn on_start_election(self: &Arc<Self>, sender: &str) {
        if self.link.local_id() <= sender {
            tracing::debug!("Ignoring election challenge from higher peer {}", sender);
            return;
        }

        let known = self.shared.lock().await.peers.address_of(sender);
        let sender = sender.to_string();
        let this = Arc::clone(self);

        tokio::spawn(async move {
            let ok = Message::ElectionOk {
                sender_id: this.link.local_id().to_string(),
            };
            let sent = match this.link.resolve(&sender, known).await {
                Ok(address) => this.link.notify(&address, ok).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                tracing::debug!("Could not acknowledge election from {}: {}", sender, e);
            }

            this.initiate_election().await;
        });
    }

    /// Handle an acknowledgement from a higher peer
    pub async fn on_election_ok(&self, sender: &str) {
        let mut shared = self.shared.lock().await;
        if shared.election.acknowledge(sender) {
            tracing::info!(
                "{} took over the election ({}/{} acknowledged)",
                sender,
                shared.election.replies_received(),
                shared.election.higher_peers().len()
            );
        }
    }

    /// Election timer for `round` expired without an announcement
    pub async fn on_election_timeout(self: &Arc<Self>, round: u64) {
        let local_id = self.link.local_id().to_string();

        let outcome = {
            let mut shared = self.shared.lock().await;
            if !shared.election.is_electing() || shared.election.round() != round {
                TimeoutOutcome::Stale
            } else if shared.election.all_acknowledged() {
                shared.election.finish();
                TimeoutOutcome::Restart
            } else {
                TimeoutOutcome::Announce(claim(&mut shared, &local_id))
            }
        };

        match outcome {
            TimeoutOutcome::Stale => {}
            TimeoutOutcome::Restart => {
                tracing::warn!(
                    "Election round {} timed out after every higher peer acknowledged, restarting",
                    round
                );
                self.initiate_election().await;
            }
            TimeoutOutcome::Announce(targets) => {
                tracing::warn!(
                    "Election round {} timed out with silent higher peers, taking over",
                    round
                );
                self.announce(targets).await;
            }
        }
    }

    /// Handle a coordinator announcement
    pub async fn on_coordinator_elected(self: &Arc<Self>, coordinator_id: &str) {
        let local_id = self.link.local_id();

        {
            let mut shared = self.shared.lock().await;
            if shared.election.coordinator().map(String::as_str) != Some(coordinator_id) {
                tracing::info!("New coordinator: {}", coordinator_id);
            }
            shared.election.set_coordinator(coordinator_id.to_string());
        }

        if local_id > coordinator_id {
            tracing::info!("Outranking announced coordinator {}, challenging", coordinator_id);
            let this = Arc::clone(self);
            tokio::spawn(async move { this.initiate_election().await });
        }
    }

    /// Start an election when the coordinator is unknown, evicted, or does
    /// not answer a ping
    pub async fn check_coordinator_liveness(self: &Arc<Self>) {
        let target = {
            let shared = self.shared.lock().await;
            if shared.election.is_electing() {
                return;
            }
            match shared.election.coordinator() {
                Some(id) if id == self.link.local_id() => return,
                Some(id) => shared.peers.address_of(id).map(|address| (id.clone(), address)),
                None => None,
            }
        };

        let Some((coordinator, address)) = target else {
            tracing::info!("No live coordinator known, starting election");
            self.initiate_election().await;
            return;
        };

        match self.link.call(&address, Message::Ping).await {
            Ok(Message::Pong { .. }) => {
                tracing::trace!("Coordinator {} is alive", coordinator);
            }
            Ok(other) => {
                tracing::warn!(
                    "Coordinator {} answered ping with {}, starting election",
                    coordinator,
                    other.type_name()
                );
                self.initiate_election().await;
            }
            Err(e) => {
                tracing::warn!("Coordinator {} failed ping: {}, starting election", coordinator, e);
                self.initiate_election().await;
            }
        }
    }

    fn arm_timer(self: &Arc<Self>, round: u64) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.config.election_timeout).await;
            this.on_election_timeout(round).await;
        });
    }

    async fn announce(&self, targets: Vec<(PeerId, String)>) {
        tracing::info!("Elected as coordinator, announcing to {} peers", targets.len());

        let announcement = Message::CoordinatorElected {
            coordinator_id: self.link.local_id().to_string(),
        };
        for (id, result) in self.link.broadcast(&targets, announcement).await {
            if let Err(e) = result {
                tracing::debug!("Coordinator announcement to {} failed: {}", id, e);
            }
        }
    }
}

/// Become coordinator under the lock; returns who to tell
fn claim(shared: &mut Shared, local_id: &str) -> Vec<(PeerId, String)> {
    shared.election.set_coordinator(local_id.to_string());
    shared.peers.snapshot()
}
