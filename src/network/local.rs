//! In-process transport
//!
//! Routes calls straight into registered handlers, encoding every message on
//! the way so the wire format is still exercised. Addresses can be cut off to
//! simulate crashed processes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{MessageHandler, Transport};
use crate::protocol::Message;
use crate::error::{Error, Result};

/// Transport connecting handlers that live in the same process
#[derive(Default)]
pub struct LocalTransport {
    routes: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    down: RwLock<HashSet<String>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `handler` reachable at `address`
    pub async fn bind(&self, address: &str, handler: Arc<dyn MessageHandler>) {
        self.routes.write().await.insert(address.to_string(), handler);
        self.down.write().await.remove(address);
    }

    /// Every call to `address` fails from now on
    pub async fn crash(&self, address: &str) {
        self.down.write().await.insert(address.to_string());
    }

    /// Undo [`LocalTransport::crash`]
    pub async fn restore(&self, address: &str) {
        self.down.write().await.remove(address);
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(&self, address: &str, message: Message) -> Result<Message> {
        if self.down.read().await.contains(address) {
            return Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: "connection refused".into(),
            });
        }

        let handler = self
            .routes
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| Error::PeerUnreachable(address.to_string()))?;

        let request = Message::deserialize(&message.serialize()?)?;
        let response = handler.handle("local", request).await;
        Message::deserialize(&response.serialize()?)
    }
}
