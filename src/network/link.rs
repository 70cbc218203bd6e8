//! Outbound calls to peers
//!
//! Wraps the transport with the local identity and the directory fallback
//! used when a peer is not in the peer table yet.

use std::sync::Arc;
use futures::future::join_all;

use super::Transport;
use crate::directory::PeerDirectory;
use crate::error::{Error, Result};
use crate::protocol::Message;
use crate::state::PeerId;

/// Local identity plus the means to reach other peers
pub struct PeerLink {
    local_id: PeerId,
    local_address: String,
    transport: Arc<dyn Transport>,
    directory: Arc<dyn PeerDirectory>,
}

impl PeerLink {
    pub fn new(
        local_id: PeerId,
        local_address: String,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn PeerDirectory>,
    ) -> Self {
        Self {
            local_id,
            local_address,
            transport,
            directory,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn directory(&self) -> &Arc<dyn PeerDirectory> {
        &self.directory
    }

    /// Request/response call
    pub async fn call(&self, address: &str, message: Message) -> Result<Message> {
        self.transport.call(address, message).await
    }

    /// One-way call: anything but an `Ack` is a failure
    pub async fn notify(&self, address: &str, message: Message) -> Result<()> {
        match self.transport.call(address, message).await? {
            Message::Ack => Ok(()),
            other => Err(Error::UnexpectedResponse {
                peer: address.to_string(),
                response: match other {
                    Message::Error { message, .. } => message,
                    other => other.type_name().to_string(),
                },
            }),
        }
    }

    /// Address for `id`: the known one, else whatever the directory says
    pub async fn resolve(&self, id: &str, known: Option<String>) -> Result<String> {
        if let Some(address) = known {
            return Ok(address);
        }
        self.directory
            .lookup(id)
            .await?
            .ok_or_else(|| Error::PeerUnreachable(id.to_string()))
    }

    /// Send the same one-way message to every target concurrently
    pub async fn broadcast(
        &self,
        targets: &[(PeerId, String)],
        message: Message,
    ) -> Vec<(PeerId, Result<()>)> {
        let calls = targets.iter().map(|(id, address)| {
            let message = message.clone();
            async move { (id.clone(), self.notify(address, message).await) }
        });
        join_all(calls).await
    }
}
