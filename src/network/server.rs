//! Network Server
//!
//! TCP server for accepting calls from other nodes.

use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};

use super::{read_message, write_message, MessageHandler};
use crate::protocol::{ErrorCode, Message};
use crate::error::{Error, Result};

/// Network server for cluster communication
pub struct NetworkServer {
    /// Bind address
    bind_address: String,
    /// Inbound call handler
    handler: Arc<dyn MessageHandler>,
    /// Bounds the number of connections served at once
    limit: Arc<Semaphore>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl NetworkServer {
    /// Create a new network server
    pub fn new(
        bind_address: String,
        handler: Arc<dyn MessageHandler>,
        max_inbound_calls: usize,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            bind_address,
            handler,
            limit: Arc::new(Semaphore::new(max_inbound_calls.max(1))),
            shutdown: shutdown_tx,
        }
    }

    /// Bind and serve until [`NetworkServer::stop`] is called
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("Network server listening on {}", self.bind_address);
        self.serve(listener).await
    }

    /// Serve an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow_and_update() {
            tracing::info!("Network server stopped before serving");
            return Ok(());
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let permit = match Arc::clone(&self.limit).acquire_owned().await {
                                Ok(permit) => permit,
                                Err(_) => break,
                            };
                            let peer_addr = addr.to_string();
                            let handler = Arc::clone(&self.handler);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, &peer_addr, handler).await {
                                    tracing::debug!("Connection error from {}: {}", peer_addr, e);
                                }
                                drop(permit);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Network server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Handle a single connection
async fn handle_connection(
    socket: TcpStream,
    peer_addr: &str,
    handler: Arc<dyn MessageHandler>,
) -> Result<()> {
    let (mut reader, mut writer) = socket.into_split();

    loop {
        match read_message(&mut reader).await {
            Ok(message) => {
                tracing::trace!("Received {} from {}", message.type_name(), peer_addr);
                let response = handler.handle(peer_addr, message).await;
                write_message(&mut writer, &response).await?;
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(Error::InvalidMessage(reason)) => {
                tracing::warn!("Rejecting malformed message from {}: {}", peer_addr, reason);
                let response = Message::error(ErrorCode::InvalidMessage, reason);
                write_message(&mut writer, &response).await?;
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}
