//! Peer Directory
//!
//! Name-to-address registry used for discovery. The node core only sees the
//! [`PeerDirectory`] trait; the directory service itself is a separate
//! process (`peerlock directory`) reached through [`RemoteDirectory`].

mod remote;

pub use remote::RemoteDirectory;

use std::collections::{BTreeMap, HashMap};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::network::MessageHandler;
use crate::protocol::{ErrorCode, Message};

/// Registry contract consumed by the node core
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Bind `id` to `address`, replacing any previous binding
    async fn register(&self, id: &str, address: &str) -> Result<()>;

    /// Resolve a single name
    async fn lookup(&self, id: &str) -> Result<Option<String>>;

    /// Every registered name starting with `prefix`
    async fn list(&self, prefix: &str) -> Result<HashMap<String, String>>;
}

/// Directory kept in process memory
#[derive(Default)]
pub struct InMemoryDirectory {
    entries: RwLock<BTreeMap<String, String>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a registration
    pub async fn unregister(&self, id: &str) -> Option<String> {
        self.entries.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl PeerDirectory for InMemoryDirectory {
    async fn register(&self, id: &str, address: &str) -> Result<()> {
        let previous = self
            .entries
            .write()
            .await
            .insert(id.to_string(), address.to_string());

        match previous {
            Some(old) if old != address => {
                tracing::info!("Directory: {} moved {} -> {}", id, old, address)
            }
            Some(_) => {}
            None => tracing::info!("Directory: registered {} at {}", id, address),
        }
        Ok(())
    }

    async fn lookup(&self, id: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(id).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<HashMap<String, String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(id, _)| id.starts_with(prefix))
            .map(|(id, address)| (id.clone(), address.clone()))
            .collect())
    }
}

/// Serves the directory over the node wire protocol
#[async_trait]
impl MessageHandler for InMemoryDirectory {
    async fn handle(&self, peer_addr: &str, message: Message) -> Message {
        let result = match message {
            Message::Register { id, address } => {
                self.register(&id, &address).await.map(|_| Message::Ack)
            }
            Message::Lookup { id } => self
                .lookup(&id)
                .await
                .map(|address| Message::LookupResponse { address }),
            Message::List { prefix } => self.list(&prefix).await.map(|entries| {
                let mut entries: Vec<_> = entries.into_iter().collect();
                entries.sort();
                Message::ListResponse { entries }
            }),
            Message::Ping => Ok(Message::Pong {
                node_id: "directory".into(),
            }),
            other => {
                tracing::debug!("Directory ignoring {} from {}", other.type_name(), peer_addr);
                Ok(Message::error(ErrorCode::Unsupported, other.type_name()))
            }
        };

        result.unwrap_or_else(|e| Message::error(ErrorCode::Internal, e.to_string()))
    }
}
