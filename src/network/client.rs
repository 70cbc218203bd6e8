//! Network Client
//!
//! TCP client for calling other nodes and the peer directory.

use std::time::Duration;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{read_message, write_message, Transport};
use crate::protocol::Message;
use crate::error::{Error, Result};

/// Network client for connecting to peer nodes
///
/// Every call opens its own connection: peers come and go often enough that
/// a pooled socket is more likely to be dead than reusable.
#[derive(Debug, Clone)]
pub struct NetworkClient {
    /// Connection timeout
    connect_timeout: Duration,
    /// Request timeout (connect + write + read)
    request_timeout: Duration,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }

    /// Send a message to a peer and wait for response
    pub async fn send(&self, address: &str, message: Message) -> Result<Message> {
        let result = timeout(
            self.request_timeout,
            self.send_inner(address, message),
        ).await;

        match result {
            Ok(inner_result) => inner_result,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Send without timeout wrapper
    async fn send_inner(&self, address: &str, message: Message) -> Result<Message> {
        let stream = self.connect(address).await?;
        let (mut reader, mut writer) = stream.into_split();

        write_message(&mut writer, &message).await?;
        read_message(&mut reader).await
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(
            self.connect_timeout,
            TcpStream::connect(address),
        ).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }
}

#[async_trait]
impl Transport for NetworkClient {
    async fn call(&self, address: &str, message: Message) -> Result<Message> {
        self.send(address, message).await
    }
}
