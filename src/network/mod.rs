//! Network Module
//!
//! Handles communication between nodes: framed TCP for real deployments
//! and an in-process transport for multi-node tests.

mod server;
mod client;
mod local;
mod link;

pub use server::NetworkServer;
pub use client::NetworkClient;
pub use local::LocalTransport;
pub use link::PeerLink;

use async_trait::async_trait;

use crate::protocol::{FrameHeader, Message, MAX_FRAME_SIZE};
use crate::error::{Error, Result};

/// Outbound half of the remote-call mesh
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `message` to `address` and wait for its response
    async fn call(&self, address: &str, message: Message) -> Result<Message>;
}

/// Inbound half of the remote-call mesh
///
/// Implementations must be total: every message yields a response, and
/// unexpected input is answered with [`Message::Error`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, peer_addr: &str, message: Message) -> Message;
}

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > MAX_FRAME_SIZE {
        return Err(Error::InvalidMessage(format!(
            "frame of {} bytes exceeds limit",
            header.length
        )));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    header.verify(&body)?;
    Message::deserialize(&body)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}
