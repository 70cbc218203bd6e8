//! Node
//!
//! Composition root: owns the shared state and the three protocol
//! components, runs their periodic duties, and dispatches inbound calls.

use std::sync::Arc;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::interval_at;

use crate::config::PeerLockConfig;
use crate::detector::{DetectorConfig, FailureDetector, MembershipChange};
use crate::directory::PeerDirectory;
use crate::election::{ElectionConfig, ElectionCoordinator, Role};
use crate::error::{Error, Result};
use crate::mutex::{Grant, MutexConfig, MutexCoordinator, NodeState};
use crate::network::{MessageHandler, PeerLink, Transport};
use crate::protocol::{ErrorCode, Message};
use crate::state::{shared_state, PeerId, SharedState, Ticket};

/// Everything a node needs to know about itself
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub id: PeerId,
    /// Address peers use to reach this node
    pub address: String,
    pub heartbeat_interval: Duration,
    pub liveness_check_interval: Duration,
    pub detector: DetectorConfig,
    pub mutex: MutexConfig,
    pub election: ElectionConfig,
}

impl NodeSettings {
    pub fn from_config(config: &PeerLockConfig) -> Self {
        let timing = &config.timing;
        Self {
            id: config.node.id.clone(),
            address: config.advertise_address().to_string(),
            heartbeat_interval: timing.heartbeat_interval(),
            liveness_check_interval: timing.liveness_check_interval(),
            detector: DetectorConfig {
                heartbeat_timeout: timing.heartbeat_timeout(),
                namespace: config.node.namespace.clone(),
            },
            mutex: MutexConfig {
                request_timeout: timing.request_timeout(),
                resource_access: timing.resource_access(),
                on_timeout: config.mutex.on_request_timeout,
            },
            election: ElectionConfig {
                election_timeout: timing.election_timeout(),
            },
        }
    }
}

/// Snapshot shown to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: PeerId,
    pub state: NodeState,
    pub role: Role,
    pub coordinator: Option<PeerId>,
    pub peers: Vec<PeerId>,
    pub deferred: usize,
    pub clock: u64,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Node:        {}", self.id)?;
        writeln!(f, "State:       {}", self.state)?;
        writeln!(f, "Role:        {}", self.role)?;
        writeln!(
            f,
            "Coordinator: {}",
            self.coordinator.as_deref().unwrap_or("(unknown)")
        )?;
        writeln!(f, "Deferred:    {}", self.deferred)?;
        writeln!(f, "Clock:       {}", self.clock)?;
        write!(f, "Peers ({}):   {}", self.peers.len(), self.peers.join(", "))
    }
}

pub struct Node {
    settings: NodeSettings,
    shared: SharedState,
    link: Arc<PeerLink>,
    mutex: Arc<MutexCoordinator>,
    detector: Arc<FailureDetector>,
    election: Arc<ElectionCoordinator>,
    shutdown: watch::Sender<bool>,
}

impl Node {
    pub fn new(
        settings: NodeSettings,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn PeerDirectory>,
    ) -> Arc<Self> {
        let shared = shared_state(settings.id.clone());
        let link = Arc::new(PeerLink::new(
            settings.id.clone(),
            settings.address.clone(),
            transport,
            directory,
        ));

        let mutex = Arc::new(MutexCoordinator::new(
            shared.clone(),
            Arc::clone(&link),
            settings.mutex.clone(),
        ));
        let detector = Arc::new(FailureDetector::new(
            shared.clone(),
            Arc::clone(&link),
            settings.detector.clone(),
        ));
        let election = Arc::new(ElectionCoordinator::new(
            shared.clone(),
            Arc::clone(&link),
            settings.election.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            settings,
            shared,
            link,
            mutex,
            detector,
            election,
            shutdown,
        })
    }

    pub fn id(&self) -> &str {
        &self.settings.id
    }

    pub fn address(&self) -> &str {
        &self.settings.address
    }

    /// Join the group and start the periodic duties
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        tracing::info!("Starting node {} at {}", self.id(), self.address());

        if let Err(e) = self.link.directory().register(self.id(), self.address()).await {
            tracing::warn!("Could not register in the directory: {} (retrying on refresh)", e);
        }
        self.refresh_membership().await;
        self.election.initiate_election().await;

        self.spawn_heartbeat_task();
        self.spawn_maintenance_task();
        self.spawn_liveness_task();
        Ok(())
    }

    /// Stop the periodic duties and refuse further inbound calls
    pub fn shutdown(&self) {
        tracing::info!("Node {} shutting down", self.id());
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    // ========== Public surface ==========

    /// Block until this node holds the resource
    pub async fn request_critical_section(&self) -> Result<Grant> {
        self.mutex.request_critical_section().await
    }

    /// Leave the critical section; returns how many deferred requests were
    /// answered
    pub async fn release_critical_section(&self) -> Result<usize> {
        self.mutex.release_critical_section().await
    }

    pub async fn current_state(&self) -> NodeState {
        self.mutex.state().await
    }

    pub async fn current_coordinator(&self) -> Option<PeerId> {
        self.election.coordinator().await
    }

    pub async fn list_active_peers(&self) -> Vec<PeerId> {
        self.shared.lock().await.peers.ids()
    }

    pub async fn status(&self) -> NodeStatus {
        let shared = self.shared.lock().await;
        NodeStatus {
            id: self.id().to_string(),
            state: shared.mutex.state(),
            role: shared.election.role(self.id()),
            coordinator: shared.election.coordinator().cloned(),
            peers: shared.peers.ids(),
            deferred: shared.mutex.deferred_len(),
            clock: shared.clock.now(),
        }
    }

    // ========== Periodic duties ==========

    /// Evict silent peers and forget them in the mutex bookkeeping
    pub async fn sweep(&self) -> Vec<PeerId> {
        self.evict_stale_at(Instant::now()).await
    }

    pub async fn evict_stale_at(&self, now: Instant) -> Vec<PeerId> {
        let evicted = self.detector.sweep_at(now).await;
        self.mutex.forget_peers(&evicted).await;
        evicted
    }

    /// Reconcile with the directory; failures keep the current table
    pub async fn refresh_membership(&self) -> Option<MembershipChange> {
        match self.detector.refresh_membership().await {
            Ok(change) => {
                self.mutex.forget_peers(&change.removed).await;
                Some(change)
            }
            Err(e) => {
                tracing::warn!("Membership refresh failed, keeping current peers: {}", e);
                None
            }
        }
    }

    fn spawn_heartbeat_task(self: &Arc<Self>) {
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let period = node.settings.heartbeat_interval;
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => node.detector.send_heartbeats().await,
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("Heartbeat task stopped");
        });
    }

    fn spawn_maintenance_task(self: &Arc<Self>) {
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let period = node.settings.heartbeat_interval;
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        node.sweep().await;
                        node.refresh_membership().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("Maintenance task stopped");
        });
    }

    fn spawn_liveness_task(self: &Arc<Self>) {
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let period = node.settings.liveness_check_interval;
            // Spread the first check so peers started together do not all
            // probe at once
            let jitter_ms = rand::thread_rng().gen_range(0..=period.as_millis() as u64);
            let start = tokio::time::Instant::now() + period + Duration::from_millis(jitter_ms);
            let mut ticker = interval_at(start, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => node.election.check_coordinator_liveness().await,
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("Liveness task stopped");
        });
    }
}

fn require_id(field: &str, value: &str) -> std::result::Result<(), Message> {
    if value.is_empty() {
        Err(Message::error(
            ErrorCode::InvalidMessage,
            format!("{} must not be empty", field),
        ))
    } else {
        Ok(())
    }
}

impl Node {
    /// Route an inbound call to its component. Total: unexpected or
    /// malformed calls are answered with [`Message::Error`].
    pub async fn dispatch(&self, peer_addr: &str, message: Message) -> Message {
        if self.is_shutting_down() {
            return Message::error(ErrorCode::ShuttingDown, "node is shutting down");
        }
        tracing::trace!("Dispatching {} from {}", message.type_name(), peer_addr);

        match message {
            Message::Request { timestamp, requester_id } => {
                if let Err(rejection) = require_id("requester_id", &requester_id) {
                    return rejection;
                }
                self.mutex.on_request(Ticket::new(timestamp, requester_id)).await;
                Message::Ack
            }
            Message::Reply { from, timestamp } => {
                self.mutex.on_reply(&from, timestamp).await;
                Message::Ack
            }
            Message::Heartbeat { sender_id, address } => {
                if let Err(rejection) = require_id("sender_id", &sender_id) {
                    return rejection;
                }
                self.detector.on_heartbeat(&sender_id, &address).await;
                Message::Ack
            }
            Message::StartElection { sender_id } => {
                if let Err(rejection) = require_id("sender_id", &sender_id) {
                    return rejection;
                }
                self.election.on_start_election(&sender_id).await;
                Message::Ack
            }
            Message::ElectionOk { sender_id } => {
                self.election.on_election_ok(&sender_id).await;
                Message::Ack
            }
            Message::CoordinatorElected { coordinator_id } => {
                if let Err(rejection) = require_id("coordinator_id", &coordinator_id) {
                    return rejection;
                }
                self.election.on_coordinator_elected(&coordinator_id).await;
                Message::Ack
            }
            Message::Ping => Message::Pong {
                node_id: self.id().to_string(),
            },
            Message::StatusRequest => {
                let status = self.status().await;
                Message::StatusResponse {
                    node_id: status.id,
                    state: status.state,
                    coordinator: status.coordinator,
                    peers: status.peers,
                }
            }
            other => {
                tracing::debug!("Rejecting {} from {}", other.type_name(), peer_addr);
                Message::error(
                    ErrorCode::Unsupported,
                    format!("{} is not served by peers", other.type_name()),
                )
            }
        }
    }
}

#[async_trait]
impl MessageHandler for Node {
    async fn handle(&self, peer_addr: &str, message: Message) -> Message {
        self.dispatch(peer_addr, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::config::RequestTimeoutPolicy;
    use crate::directory::InMemoryDirectory;
    use crate::election::ElectionPhase;
    use crate::network::LocalTransport;

    fn settings(id: &str) -> NodeSettings {
        NodeSettings {
            id: id.to_string(),
            address: format!("{}:7700", id),
            heartbeat_interval: Duration::from_millis(50),
            liveness_check_interval: Duration::from_millis(100),
            detector: DetectorConfig {
                heartbeat_timeout: Duration::from_millis(200),
                namespace: "ricart.".into(),
            },
            mutex: MutexConfig {
                request_timeout: Duration::from_secs(2),
                resource_access: Duration::from_secs(30),
                on_timeout: RequestTimeoutPolicy::Proceed,
            },
            election: ElectionConfig {
                election_timeout: Duration::from_millis(300),
            },
        }
    }

    struct Cluster {
        transport: Arc<LocalTransport>,
        nodes: Vec<Arc<Node>>,
    }

    impl Cluster {
        fn node(&self, index: usize) -> &Arc<Node> {
            &self.nodes[index]
        }

        /// Simulate a process crash
        async fn kill(&self, index: usize) {
            let node = self.node(index);
            node.shutdown();
            self.transport.crash(node.address()).await;
        }
    }

    /// Nodes that know each other through the directory, without periodic
    /// tasks running
    async fn cluster_with(all: Vec<NodeSettings>) -> Cluster {
        let transport = Arc::new(LocalTransport::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let mut nodes = Vec::new();

        for settings in all {
            let node = Node::new(settings, transport.clone(), directory.clone());
            transport.bind(node.address(), node.clone()).await;
            directory.register(node.id(), node.address()).await.unwrap();
            nodes.push(node);
        }
        for node in &nodes {
            node.refresh_membership().await.unwrap();
        }

        Cluster { transport, nodes }
    }

    async fn cluster(ids: &[&str]) -> Cluster {
        cluster_with(ids.iter().map(|id| settings(id)).collect()).await
    }

    async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if check().await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_single_node_granted_immediately() {
        let c = cluster(&["ricart.PeerA"]).await;
        let a = c.node(0);

        let grant = a.request_critical_section().await.unwrap();
        assert_eq!(grant.replies, 0);
        assert_eq!(a.current_state().await, NodeState::Held);

        assert_eq!(a.release_critical_section().await.unwrap(), 0);
        assert_eq!(a.current_state().await, NodeState::Released);
    }

    #[tokio::test]
    async fn test_invalid_transitions_reported() {
        let c = cluster(&["ricart.PeerA"]).await;
        let a = c.node(0);

        assert!(matches!(
            a.release_critical_section().await,
            Err(Error::InvalidStateTransition { .. })
        ));

        a.request_critical_section().await.unwrap();
        assert!(matches!(
            a.request_critical_section().await,
            Err(Error::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_equal_timestamps_lower_id_wins() {
        let c = cluster(&["ricart.PeerA", "ricart.PeerB"]).await;
        let (a, b) = (c.node(0), c.node(1));

        // Both WANTED with timestamp 100
        a.shared
            .lock()
            .await
            .mutex
            .begin(Ticket::new(100, "ricart.PeerA"), vec!["ricart.PeerB".to_string()])
            .unwrap();
        b.shared
            .lock()
            .await
            .mutex
            .begin(Ticket::new(100, "ricart.PeerB"), vec!["ricart.PeerA".to_string()])
            .unwrap();

        a.mutex.on_request(Ticket::new(100, "ricart.PeerB")).await;
        b.mutex.on_request(Ticket::new(100, "ricart.PeerA")).await;

        assert_eq!(a.status().await.deferred, 1);
        assert_eq!(b.status().await.deferred, 0);

        // B's immediate reply satisfies A
        assert!(eventually(Duration::from_secs(1), || async {
            a.shared.lock().await.mutex.is_satisfied()
        })
        .await);
        assert!(!b.shared.lock().await.mutex.is_satisfied());
    }

    #[tokio::test]
    async fn test_concurrent_requests_first_ticket_wins() {
        let c = cluster(&["ricart.PeerA", "ricart.PeerB"]).await;
        let (a, b) = (c.node(0).clone(), c.node(1).clone());

        let grant_a = a.request_critical_section().await.unwrap();
        let waiter = {
            let b = b.clone();
            tokio::spawn(async move { b.request_critical_section().await })
        };

        assert!(eventually(Duration::from_secs(1), || async {
            a.status().await.deferred == 1
        })
        .await);
        assert_eq!(b.current_state().await, NodeState::Wanted);

        assert_eq!(a.release_critical_section().await.unwrap(), 1);
        let grant_b = waiter.await.unwrap().unwrap();
        assert!(grant_a.ticket < grant_b.ticket);
        assert_eq!(b.current_state().await, NodeState::Held);
    }

    #[tokio::test]
    async fn test_mutual_exclusion_under_contention() {
        let c = cluster(&["ricart.PeerA", "ricart.PeerB", "ricart.PeerC"]).await;
        let holders = Arc::new(AtomicUsize::new(0));
        let max_holders = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for node in &c.nodes {
            let node = node.clone();
            let holders = holders.clone();
            let max_holders = max_holders.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..2 {
                    let grant = node.request_critical_section().await.unwrap();
                    assert!(grant.missing.is_empty());

                    let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                    max_holders.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    holders.fetch_sub(1, Ordering::SeqCst);

                    node.release_critical_section().await.unwrap();
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_holders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_flushes_every_deferred_request() {
        let c = cluster(&["ricart.PeerA", "ricart.PeerB", "ricart.PeerC"]).await;
        let a = c.node(0).clone();
        a.request_critical_section().await.unwrap();

        let waiters: Vec<_> = [1, 2]
            .into_iter()
            .map(|i| {
                let node = c.node(i).clone();
                tokio::spawn(async move {
                    node.request_critical_section().await.unwrap();
                    node.release_critical_section().await.unwrap();
                })
            })
            .collect();

        assert!(eventually(Duration::from_secs(1), || async {
            a.status().await.deferred == 2
        })
        .await);
        assert_eq!(a.release_critical_section().await.unwrap(), 2);

        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(a.status().await.deferred, 0);
    }

    #[tokio::test]
    async fn test_auto_release_after_access_duration() {
        let mut solo = settings("ricart.PeerA");
        solo.mutex.resource_access = Duration::from_millis(50);
        let c = cluster_with(vec![solo]).await;
        let a = c.node(0);

        a.request_critical_section().await.unwrap();
        assert!(eventually(Duration::from_secs(1), || async {
            a.current_state().await == NodeState::Released
        })
        .await);
    }

    #[tokio::test]
    async fn test_timeout_policy_abort() {
        let mut requester = settings("ricart.PeerA");
        requester.mutex.request_timeout = Duration::from_millis(100);
        requester.mutex.on_timeout = RequestTimeoutPolicy::Abort;
        let c = cluster_with(vec![requester, settings("ricart.PeerB")]).await;
        let (a, b) = (c.node(0), c.node(1));

        b.request_critical_section().await.unwrap();
        let result = a.request_critical_section().await;

        assert!(matches!(
            result,
            Err(Error::QuorumNotReached { received: 0, required: 1 })
        ));
        assert_eq!(a.current_state().await, NodeState::Released);
    }

    #[tokio::test]
    async fn test_timeout_policy_proceed() {
        let mut requester = settings("ricart.PeerA");
        requester.mutex.request_timeout = Duration::from_millis(100);
        let c = cluster_with(vec![requester, settings("ricart.PeerB")]).await;
        let (a, b) = (c.node(0), c.node(1));

        b.request_critical_section().await.unwrap();
        let grant = a.request_critical_section().await.unwrap();

        assert_eq!(grant.missing, vec!["ricart.PeerB".to_string()]);
        assert_eq!(a.current_state().await, NodeState::Held);
    }

    #[tokio::test]
    async fn test_unreachable_peer_excluded_from_wait() {
        let c = cluster(&["ricart.PeerA", "ricart.PeerB", "ricart.PeerC"]).await;
        c.kill(2).await;

        let grant = c.node(0).request_critical_section().await.unwrap();
        assert_eq!(grant.replies, 1);
        assert!(grant.missing.is_empty());
    }

    #[tokio::test]
    async fn test_eviction_unblocks_pending_request() {
        let c = cluster(&["ricart.PeerA", "ricart.PeerB"]).await;
        let (a, b) = (c.node(0).clone(), c.node(1).clone());

        // B holds and goes silent, so A's request is deferred forever
        b.request_critical_section().await.unwrap();
        let waiter = {
            let a = a.clone();
            tokio::spawn(async move { a.request_critical_section().await })
        };
        assert!(eventually(Duration::from_secs(1), || async {
            b.status().await.deferred == 1
        })
        .await);
        c.kill(1).await;

        let later = Instant::now() + Duration::from_millis(250);
        assert_eq!(a.evict_stale_at(later).await, vec!["ricart.PeerB".to_string()]);

        let grant = waiter.await.unwrap().unwrap();
        assert_eq!(grant.replies, 0);
        assert!(a.list_active_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_election_converges_on_highest_id() {
        let c = cluster(&["ricart.PeerA", "ricart.PeerB", "ricart.PeerC"]).await;
        c.node(0).election.initiate_election().await;

        assert!(eventually(Duration::from_secs(1), || async {
            for node in &c.nodes {
                if node.current_coordinator().await.as_deref() != Some("ricart.PeerC") {
                    return false;
                }
            }
            true
        })
        .await);
        assert_eq!(c.node(2).status().await.role, Role::Coordinator);
        assert_eq!(c.node(0).election.phase().await, ElectionPhase::Idle);
    }

    #[tokio::test]
    async fn test_next_highest_takes_over_when_coordinator_dies() {
        let c = cluster(&["ricart.PeerA", "ricart.PeerB", "ricart.PeerC"]).await;
        c.node(1).election.initiate_election().await;
        assert!(eventually(Duration::from_secs(1), || async {
            c.node(0).current_coordinator().await.as_deref() == Some("ricart.PeerC")
        })
        .await);

        c.kill(2).await;
        let started = Instant::now();
        c.node(0).election.check_coordinator_liveness().await;
        c.node(1).election.check_coordinator_liveness().await;

        assert!(eventually(Duration::from_millis(300), || async {
            c.node(0).current_coordinator().await.as_deref() == Some("ricart.PeerB")
                && c.node(1).current_coordinator().await.as_deref() == Some("ricart.PeerB")
        })
        .await);
        assert!(started.elapsed() < Duration::from_millis(300) + Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_higher_node_challenges_lower_announcement() {
        let c = cluster(&["ricart.PeerA", "ricart.PeerB"]).await;
        c.node(1).election.on_coordinator_elected("ricart.PeerA").await;

        assert!(eventually(Duration::from_secs(1), || async {
            c.node(0).current_coordinator().await.as_deref() == Some("ricart.PeerB")
                && c.node(1).current_coordinator().await.as_deref() == Some("ricart.PeerB")
        })
        .await);
    }

    #[tokio::test]
    async fn test_dispatch_is_total() {
        let c = cluster(&["ricart.PeerA"]).await;
        let a = c.node(0);

        assert_eq!(
            a.dispatch("test", Message::Ping).await,
            Message::Pong { node_id: "ricart.PeerA".into() }
        );
        assert!(matches!(
            a.dispatch("test", Message::Lookup { id: "x".into() }).await,
            Message::Error { code: ErrorCode::Unsupported, .. }
        ));
        assert!(matches!(
            a.dispatch("test", Message::Request { timestamp: 1, requester_id: String::new() }).await,
            Message::Error { code: ErrorCode::InvalidMessage, .. }
        ));
        // Stray reply for a request never made
        assert_eq!(
            a.dispatch("test", Message::Reply { from: "ricart.PeerZ".into(), timestamp: 9 }).await,
            Message::Ack
        );

        a.shutdown();
        assert!(matches!(
            a.dispatch("test", Message::Ping).await,
            Message::Error { code: ErrorCode::ShuttingDown, .. }
        ));
    }

    #[tokio::test]
    async fn test_started_nodes_discover_and_elect() {
        let transport = Arc::new(LocalTransport::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let a = Node::new(settings("ricart.PeerA"), transport.clone(), directory.clone());
        let b = Node::new(settings("ricart.PeerB"), transport.clone(), directory.clone());
        transport.bind(a.address(), a.clone()).await;
        transport.bind(b.address(), b.clone()).await;

        a.start().await.unwrap();
        b.start().await.unwrap();

        assert!(eventually(Duration::from_secs(2), || async {
            a.list_active_peers().await == vec!["ricart.PeerB".to_string()]
                && b.list_active_peers().await == vec!["ricart.PeerA".to_string()]
                && a.current_coordinator().await.as_deref() == Some("ricart.PeerB")
                && b.current_coordinator().await.as_deref() == Some("ricart.PeerB")
        })
        .await);

        // B dies but stays registered: A evicts it and takes over
        b.shutdown();
        transport.crash(b.address()).await;

        assert!(eventually(Duration::from_secs(2), || async {
            a.list_active_peers().await.is_empty()
                && a.current_coordinator().await.as_deref() == Some("ricart.PeerA")
        })
        .await);
        a.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_before_start_refuses_calls() {
        let c = cluster(&["ricart.PeerA"]).await;
        let a = c.node(0);

        a.shutdown();
        assert!(a.is_shutting_down());
        assert!(matches!(a.start().await, Err(Error::ShuttingDown)));
        assert!(matches!(
            a.dispatch("test", Message::Heartbeat {
                sender_id: "ricart.PeerB".into(),
                address: "b:1".into(),
            })
            .await,
            Message::Error { code: ErrorCode::ShuttingDown, .. }
        ));
        assert!(a.list_active_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_crashed_peer_left_in_directory_stays_evicted() {
        let c = cluster(&["ricart.PeerA", "ricart.PeerB"]).await;
        let a = c.node(0);
        c.kill(1).await;

        let later = Instant::now() + Duration::from_millis(250);
        assert_eq!(a.evict_stale_at(later).await, vec!["ricart.PeerB".to_string()]);

        let change = a.refresh_membership().await.unwrap();
        assert!(change.added.is_empty());
        assert!(a.list_active_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_restored_peer_replies_again() {
        let c = cluster(&["ricart.PeerA", "ricart.PeerB"]).await;
        let a = c.node(0);

        c.transport.crash(c.node(1).address()).await;
        let grant = a.request_critical_section().await.unwrap();
        assert_eq!(grant.replies, 0);
        a.release_critical_section().await.unwrap();

        c.transport.restore(c.node(1).address()).await;
        let grant = a.request_critical_section().await.unwrap();
        assert_eq!(grant.replies, 1);
        assert!(grant.missing.is_empty());
    }

    /// Accepts every call and never acts on it, like a hung process
    struct Unresponsive;

    #[async_trait]
    impl MessageHandler for Unresponsive {
        async fn handle(&self, _peer_addr: &str, _message: Message) -> Message {
            Message::Ack
        }
    }

    /// Takes over every election it is challenged in, then never announces
    struct StalledChallenger {
        id: String,
        transport: Arc<LocalTransport>,
        challenges: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for StalledChallenger {
        async fn handle(&self, _peer_addr: &str, message: Message) -> Message {
            if let Message::StartElection { sender_id } = message {
                self.challenges.fetch_add(1, Ordering::SeqCst);
                let ok = Message::ElectionOk { sender_id: self.id.clone() };
                let _ = self.transport.call(&format!("{}:7700", sender_id), ok).await;
            }
            Message::Ack
        }
    }

    #[tokio::test]
    async fn test_election_timer_claims_when_higher_peer_stays_silent() {
        let c = cluster(&["ricart.PeerA", "ricart.PeerB"]).await;
        c.transport.bind(c.node(1).address(), Arc::new(Unresponsive)).await;
        let a = c.node(0);

        a.election.initiate_election().await;
        assert_eq!(a.election.phase().await, ElectionPhase::Electing);
        assert_eq!(a.current_coordinator().await, None);

        assert!(eventually(Duration::from_secs(1), || async {
            a.current_coordinator().await.as_deref() == Some("ricart.PeerA")
        })
        .await);
        assert_eq!(a.election.phase().await, ElectionPhase::Idle);
    }

    #[tokio::test]
    async fn test_election_timer_restarts_after_acknowledged_takeover_stalls() {
        let c = cluster(&["ricart.PeerA", "ricart.PeerB"]).await;
        let stalled = Arc::new(StalledChallenger {
            id: "ricart.PeerB".into(),
            transport: c.transport.clone(),
            challenges: AtomicUsize::new(0),
        });
        c.transport.bind(c.node(1).address(), stalled.clone()).await;
        let a = c.node(0);

        a.election.initiate_election().await;
        assert_eq!(stalled.challenges.load(Ordering::SeqCst), 1);

        // Acknowledged, so the timer challenges again instead of claiming
        assert!(eventually(Duration::from_secs(2), || async {
            stalled.challenges.load(Ordering::SeqCst) >= 2
        })
        .await);
        assert_eq!(a.current_coordinator().await, None);
    }

    #[tokio::test]
    async fn test_restarted_election_converges_on_live_higher_peer() {
        let c = cluster(&["ricart.PeerA", "ricart.PeerB"]).await;
        let (a, b) = (c.node(0), c.node(1));

        let round = a
            .shared
            .lock()
            .await
            .election
            .begin(vec!["ricart.PeerB".to_string()]);
        a.election.on_election_ok("ricart.PeerB").await;
        a.election.on_election_timeout(round).await;

        assert!(eventually(Duration::from_secs(1), || async {
            a.current_coordinator().await.as_deref() == Some("ricart.PeerB")
                && b.current_coordinator().await.as_deref() == Some("ricart.PeerB")
        })
        .await);
    }
}
