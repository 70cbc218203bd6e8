//! Failure Detection
//!
//! Heartbeats keep peers in the table; silence evicts them. Membership is
//! also reconciled against the peer directory, independently of heartbeats.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::network::PeerLink;
use crate::protocol::Message;
use crate::state::{PeerId, SharedState};

/// Failure detector configuration
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Silence after which a peer is evicted
    pub heartbeat_timeout: Duration,
    /// Directory prefix of this group
    pub namespace: String,
}

/// Peers added and removed by one membership refresh
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipChange {
    pub added: Vec<PeerId>,
    pub removed: Vec<PeerId>,
}

impl MembershipChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub struct FailureDetector {
    shared: SharedState,
    link: Arc<PeerLink>,
    config: DetectorConfig,
}

impl FailureDetector {
    pub fn new(shared: SharedState, link: Arc<PeerLink>, config: DetectorConfig) -> Self {
        Self {
            shared,
            link,
            config,
        }
    }

    /// Signal liveness to every known peer; failures surface through the
    /// sweep on the other side, not here
    pub async fn send_heartbeats(&self) {
        let targets = self.shared.lock().await.peers.snapshot();
        if targets.is_empty() {
            return;
        }

        let heartbeat = Message::Heartbeat {
            sender_id: self.link.local_id().to_string(),
            address: self.link.local_address().to_string(),
        };
        for (id, result) in self.link.broadcast(&targets, heartbeat).await {
            if let Err(e) = result {
                tracing::debug!("Heartbeat to {} failed: {}", id, e);
            }
        }
    }

    /// Handle an inbound heartbeat
    pub async fn on_heartbeat(&self, sender: &str, address: &str) {
        if sender == self.link.local_id() {
            return;
        }

        let mut shared = self.shared.lock().await;
        if shared.peers.record_heartbeat(sender, address, Instant::now()) {
            tracing::info!("Discovered peer {} at {} via heartbeat", sender, address);
        } else {
            tracing::trace!("Heartbeat from {}", sender);
        }
    }

    /// Evict every peer silent for longer than the heartbeat timeout
    pub async fn sweep(&self) -> Vec<PeerId> {
        self.sweep_at(Instant::now()).await
    }

    pub async fn sweep_at(&self, now: Instant) -> Vec<PeerId> {
        let mut shared = self.shared.lock().await;
        let stale = shared.peers.stale(self.config.heartbeat_timeout, now);
        for id in &stale {
            shared.peers.evict(id);
        }

        if !stale.is_empty() {
            tracing::warn!(
                "Evicted peers after {:?} of silence: {:?} (active: {:?})",
                self.config.heartbeat_timeout,
                stale,
                shared.peers.ids()
            );
        }
        stale
    }

    /// Reconcile the peer table with the directory listing for this
    /// namespace. The table is left untouched when the directory fails.
    pub async fn refresh_membership(&self) -> Result<MembershipChange> {
        let directory = self.link.directory();
        let listed = directory.list(&self.config.namespace).await?;

        let local_id = self.link.local_id();
        if !listed.contains_key(local_id) {
            tracing::info!("Not listed in the directory, registering as {}", local_id);
            directory.register(local_id, self.link.local_address()).await?;
        }

        let now = Instant::now();
        let mut change = MembershipChange::default();
        let mut shared = self.shared.lock().await;

        for (id, address) in &listed {
            if id != local_id && shared.peers.admit(id, address, now) {
                change.added.push(id.clone());
            }
        }
        shared.peers.retain_evicted(|id| listed.contains_key(id));
        for id in shared.peers.ids() {
            if !listed.contains_key(&id) {
                shared.peers.remove(&id);
                change.removed.push(id);
            }
        }

        change.added.sort();
        if !change.is_empty() {
            tracing::info!(
                "Membership refreshed: +{:?} -{:?} (active: {:?})",
                change.added,
                change.removed,
                shared.peers.ids()
            );
        }
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{InMemoryDirectory, PeerDirectory};
    use crate::network::LocalTransport;
    use crate::state::shared_state;
    use async_trait::async_trait;
    use std::collections::HashMap;

    fn detector_with(directory: Arc<dyn PeerDirectory>) -> (FailureDetector, SharedState) {
        let shared = shared_state("ricart.PeerA");
        let link = Arc::new(PeerLink::new(
            "ricart.PeerA".into(),
            "a:1".into(),
            Arc::new(LocalTransport::new()),
            directory,
        ));
        let detector = FailureDetector::new(
            shared.clone(),
            link,
            DetectorConfig {
                heartbeat_timeout: Duration::from_secs(6),
                namespace: "ricart.".into(),
            },
        );
        (detector, shared)
    }

    struct DownDirectory;

    #[async_trait]
    impl PeerDirectory for DownDirectory {
        async fn register(&self, _id: &str, _address: &str) -> Result<()> {
            Err(crate::Error::DirectoryUnavailable("down".into()))
        }
        async fn lookup(&self, _id: &str) -> Result<Option<String>> {
            Err(crate::Error::DirectoryUnavailable("down".into()))
        }
        async fn list(&self, _prefix: &str) -> Result<HashMap<String, String>> {
            Err(crate::Error::DirectoryUnavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn test_heartbeat_inserts_unknown_sender() {
        let (detector, shared) = detector_with(Arc::new(InMemoryDirectory::new()));

        detector.on_heartbeat("ricart.PeerB", "b:1").await;
        detector.on_heartbeat("ricart.PeerA", "a:1").await;

        let shared = shared.lock().await;
        assert_eq!(shared.peers.ids(), vec!["ricart.PeerB".to_string()]);
    }

    #[tokio::test]
    async fn test_sweep_evicts_silent_peers() {
        let (detector, shared) = detector_with(Arc::new(InMemoryDirectory::new()));
        detector.on_heartbeat("ricart.PeerB", "b:1").await;

        assert!(detector.sweep().await.is_empty());

        let later = Instant::now() + Duration::from_secs(7);
        assert_eq!(detector.sweep_at(later).await, vec!["ricart.PeerB".to_string()]);
        assert!(shared.lock().await.peers.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_merges_and_removes() {
        let directory = Arc::new(InMemoryDirectory::new());
        directory.register("ricart.PeerB", "b:1").await.unwrap();
        directory.register("ricart.PeerC", "c:1").await.unwrap();
        directory.register("auction.Server", "x:1").await.unwrap();

        let (detector, shared) = detector_with(directory.clone());
        let change = detector.refresh_membership().await.unwrap();
        assert_eq!(change.added, vec!["ricart.PeerB".to_string(), "ricart.PeerC".to_string()]);

        // Registered itself on the way
        assert_eq!(directory.lookup("ricart.PeerA").await.unwrap().as_deref(), Some("a:1"));

        directory.unregister("ricart.PeerC").await;
        let change = detector.refresh_membership().await.unwrap();
        assert_eq!(change.removed, vec!["ricart.PeerC".to_string()]);
        assert_eq!(shared.lock().await.peers.ids(), vec!["ricart.PeerB".to_string()]);
    }

    #[tokio::test]
    async fn test_listed_but_silent_peer_stays_evicted() {
        let directory = Arc::new(InMemoryDirectory::new());
        directory.register("ricart.PeerB", "b:1").await.unwrap();

        let (detector, shared) = detector_with(directory.clone());
        detector.refresh_membership().await.unwrap();

        // Crashed without unregistering
        let later = Instant::now() + Duration::from_secs(7);
        assert_eq!(detector.sweep_at(later).await, vec!["ricart.PeerB".to_string()]);
        let change = detector.refresh_membership().await.unwrap();
        assert!(change.added.is_empty());
        assert!(shared.lock().await.peers.is_empty());

        // Back once it speaks again
        detector.on_heartbeat("ricart.PeerB", "b:1").await;
        assert!(shared.lock().await.peers.contains("ricart.PeerB"));
    }

    #[tokio::test]
    async fn test_refresh_keeps_table_when_directory_down() {
        let (detector, shared) = detector_with(Arc::new(DownDirectory));
        detector.on_heartbeat("ricart.PeerB", "b:1").await;

        let err = detector.refresh_membership().await.unwrap_err();
        assert!(matches!(err, crate::Error::DirectoryUnavailable(_)));
        assert!(shared.lock().await.peers.contains("ricart.PeerB"));
    }
}
