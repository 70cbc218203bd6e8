//! Client side of a served peer directory

use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;

use super::PeerDirectory;
use crate::error::{Error, Result};
use crate::network::Transport;
use crate::protocol::Message;

/// Directory reached over the node wire protocol
pub struct RemoteDirectory {
    address: String,
    transport: Arc<dyn Transport>,
}

impl RemoteDirectory {
    pub fn new(address: String, transport: Arc<dyn Transport>) -> Self {
        Self { address, transport }
    }

    async fn call(&self, message: Message) -> Result<Message> {
        let kind = message.type_name();
        match self.transport.call(&self.address, message).await {
            Ok(Message::Error { message, .. }) => Err(Error::DirectoryUnavailable(format!(
                "{} rejected by {}: {}",
                kind, self.address, message
            ))),
            Ok(response) => Ok(response),
            Err(e) => Err(Error::DirectoryUnavailable(format!("{}: {}", self.address, e))),
        }
    }

    fn unexpected(&self, response: Message) -> Error {
        Error::UnexpectedResponse {
            peer: self.address.clone(),
            response: response.type_name().to_string(),
        }
    }
}

#[async_trait]
impl PeerDirectory for RemoteDirectory {
    async fn register(&self, id: &str, address: &str) -> Result<()> {
        let message = Message::Register {
            id: id.to_string(),
            address: address.to_string(),
        };
        match self.call(message).await? {
            Message::Ack => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    async fn lookup(&self, id: &str) -> Result<Option<String>> {
        match self.call(Message::Lookup { id: id.to_string() }).await? {
            Message::LookupResponse { address } => Ok(address),
            other => Err(self.unexpected(other)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<HashMap<String, String>> {
        match self.call(Message::List { prefix: prefix.to_string() }).await? {
            Message::ListResponse { entries } => Ok(entries.into_iter().collect()),
            other => Err(self.unexpected(other)),
        }
    }
}
