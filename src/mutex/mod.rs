//! Distributed Mutual Exclusion
//!
//! Ricart–Agrawala over the current peer table: a node enters the critical
//! section once every live peer has replied to its ticket, and peers that
//! hold the resource (or have priority) defer their replies until release.

mod state;

pub use state::{Decision, MutexState, NodeState};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::RequestTimeoutPolicy;
use crate::error::{Error, Result};
use crate::network::PeerLink;
use crate::protocol::Message;
use crate::state::{PeerId, SharedState, Ticket};

/// Mutual exclusion configuration
#[derive(Debug, Clone)]
pub struct MutexConfig {
    /// Upper bound on waiting for replies
    pub request_timeout: Duration,
    /// Hold duration before an automatic release
    pub resource_access: Duration,
    /// What to do when replies are missing at the deadline
    pub on_timeout: RequestTimeoutPolicy,
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            resource_access: Duration::from_secs(5),
            on_timeout: RequestTimeoutPolicy::Proceed,
        }
    }
}

/// Outcome of a successful request
#[derive(Debug, Clone)]
pub struct Grant {
    pub ticket: Ticket,
    /// Replies received
    pub replies: usize,
    /// Peers treated as dead because they never replied
    pub missing: Vec<PeerId>,
}

pub struct MutexCoordinator {
    shared: SharedState,
    link: Arc<PeerLink>,
    config: MutexConfig,
    /// Signalled whenever the reply-wait set shrinks
    progress: Notify,
}

impl MutexCoordinator {
    pub fn new(shared: SharedState, link: Arc<PeerLink>, config: MutexConfig) -> Self {
        Self {
            shared,
            link,
            config,
            progress: Notify::new(),
        }
    }

    pub async fn state(&self) -> NodeState {
        self.shared.lock().await.mutex.state()
    }

    /// Ask every known peer for permission and block until granted.
    ///
    /// Fails with [`Error::InvalidStateTransition`] unless RELEASED, and with
    /// [`Error::QuorumNotReached`] when replies are missing at the deadline
    /// under [`RequestTimeoutPolicy::Abort`].
    pub async fn request_critical_section(self: &Arc<Self>) -> Result<Grant> {
        let deadline = Instant::now() + self.config.request_timeout;

        let (ticket, targets) = {
            let mut shared = self.shared.lock().await;
            if shared.mutex.state() != NodeState::Released {
                return Err(Error::InvalidStateTransition {
                    operation: "request the critical section",
                    state: shared.mutex.state().to_string(),
                });
            }
            let ticket = Ticket::new(shared.clock.tick(), self.link.local_id());
            let targets = shared.peers.snapshot();
            shared
                .mutex
                .begin(ticket.clone(), targets.iter().map(|(id, _)| id.clone()))?;
            (ticket, targets)
        };

        tracing::info!(
            "Requesting critical section with ticket {} from {} peers",
            ticket,
            targets.len()
        );

        let request = Message::Request {
            timestamp: ticket.timestamp,
            requester_id: ticket.requester.clone(),
        };
        let unreachable: Vec<PeerId> = self
            .link
            .broadcast(&targets, request)
            .await
            .into_iter()
            .filter_map(|(id, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    tracing::warn!("Request to {} failed, not waiting for it: {}", id, e);
                    Some(id)
                }
            })
            .collect();

        if !unreachable.is_empty() {
            let mut shared = self.shared.lock().await;
            for id in &unreachable {
                shared.mutex.exclude(id);
            }
        }

        self.wait_for_replies(deadline).await;

        let mut shared = self.shared.lock().await;
        let missing: Vec<PeerId> = shared.mutex.awaiting().iter().cloned().collect();
        let replies = shared.mutex.replies();

        if !missing.is_empty() {
            match self.config.on_timeout {
                RequestTimeoutPolicy::Proceed => {
                    tracing::warn!(
                        "Request timed out with {}/{} replies, entering without {:?}",
                        replies,
                        shared.mutex.required(),
                        missing
                    );
                }
                RequestTimeoutPolicy::Abort => {
                    let required = shared.mutex.required();
                    let deferred = shared.mutex.abandon()?;
                    drop(shared);
                    tracing::warn!(
                        "Request timed out with {}/{} replies, abandoning",
                        replies,
                        required
                    );
                    self.send_replies(deferred).await;
                    return Err(Error::QuorumNotReached {
                        received: replies,
                        required,
                    });
                }
            }
        }

        let epoch = shared.mutex.enter()?;
        drop(shared);

        tracing::info!(
            "Critical section acquired with ticket {} ({} replies), holding for at most {:?}",
            ticket,
            replies,
            self.config.resource_access
        );
        self.arm_auto_release(epoch);

        Ok(Grant {
            ticket,
            replies,
            missing,
        })
    }

    /// Leave the critical section and answer every deferred request in
    /// arrival order. Returns how many deferred requests were answered.
    pub async fn release_critical_section(&self) -> Result<usize> {
        let deferred = self.shared.lock().await.mutex.release()?;
        tracing::info!(
            "Critical section released, answering {} deferred requests",
            deferred.len()
        );
        Ok(self.send_replies(deferred).await)
    }

    /// Handle an inbound request
    pub async fn on_request(self: &Arc<Self>, ticket: Ticket) {
        if ticket.requester == self.link.local_id() {
            return;
        }

        let (decision, known) = {
            let mut shared = self.shared.lock().await;
            shared.clock.observe(ticket.timestamp);
            let decision = shared.mutex.decide(&ticket);
            (decision, shared.peers.address_of(&ticket.requester))
        };

        match decision {
            Decision::Defer => {
                tracing::info!("Request {} deferred", ticket);
            }
            Decision::Grant => {
                tracing::debug!("Request {} granted", ticket);
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = this.send_reply(&ticket, known).await {
                        tracing::warn!("Failed to reply to {}: {}", ticket.requester, e);
                    }
                });
            }
        }
    }

    /// Handle an inbound reply
    pub async fn on_reply(&self, from: &str, timestamp: u64) {
        let counted = {
            let mut shared = self.shared.lock().await;
            let counted = shared.mutex.record_reply(from, timestamp);
            if counted {
                tracing::debug!(
                    "Reply from {} ({}/{})",
                    from,
                    shared.mutex.replies(),
                    shared.mutex.required()
                );
            }
            counted
        };

        if counted {
            self.progress.notify_one();
        } else {
            tracing::debug!("Ignoring stale reply from {} for timestamp {}", from, timestamp);
        }
    }

    /// Drop evicted peers from the wait set and the deferred queue
    pub async fn forget_peers(&self, peers: &[PeerId]) {
        if peers.is_empty() {
            return;
        }

        let changed = {
            let mut shared = self.shared.lock().await;
            peers
                .iter()
                .fold(false, |changed, id| shared.mutex.forget_peer(id) || changed)
        };

        if changed {
            self.progress.notify_one();
        }
    }

    /// Wait until every live peer replied or the deadline passes.
    /// The lock is only taken to check the wait set.
    async fn wait_for_replies(&self, deadline: Instant) -> bool {
        loop {
            if self.shared.lock().await.mutex.is_satisfied() {
                return true;
            }
            if tokio::time::timeout_at(deadline, self.progress.notified())
                .await
                .is_err()
            {
                return self.shared.lock().await.mutex.is_satisfied();
            }
        }
    }

    /// Release automatically after the access duration, unless this hold
    /// already ended
    fn arm_auto_release(self: &Arc<Self>, epoch: u64) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.config.resource_access).await;

            let deferred = {
                let mut shared = this.shared.lock().await;
                if shared.mutex.state() != NodeState::Held || shared.mutex.epoch() != epoch {
                    return;
                }
                match shared.mutex.release() {
                    Ok(deferred) => deferred,
                    Err(_) => return,
                }
            };

            tracing::info!(
                "Access time elapsed, releasing automatically ({} deferred requests)",
                deferred.len()
            );
            this.send_replies(deferred).await;
        });
    }

    /// Answer deferred requests one by one, in order
    async fn send_replies(&self, deferred: Vec<Ticket>) -> usize {
        let mut sent = 0;
        for ticket in deferred {
            let known = self.shared.lock().await.peers.address_of(&ticket.requester);
            match self.send_reply(&ticket, known).await {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!("Failed to reply to {} (deferred): {}", ticket.requester, e),
            }
        }
        sent
    }

    async fn send_reply(&self, ticket: &Ticket, known: Option<String>) -> Result<()> {
        let address = self.link.resolve(&ticket.requester, known).await?;
        let reply = Message::Reply {
            from: self.link.local_id().to_string(),
            timestamp: ticket.timestamp,
        };
        self.link.notify(&address, reply).await
    }
}
