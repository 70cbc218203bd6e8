//! Wire Protocol
//!
//! Defines the tagged messages exchanged between peers and with the
//! peer directory, plus the frame header that carries them.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mutex::NodeState;

/// Largest accepted frame body
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Protocol messages for node communication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    // ========== Mutual Exclusion ==========
    /// Ask for permission to enter the critical section
    Request {
        timestamp: u64,
        requester_id: String,
    },

    /// Permission for the request carrying `timestamp`
    Reply {
        from: String,
        timestamp: u64,
    },

    // ========== Liveness ==========
    /// Periodic liveness signal
    Heartbeat {
        sender_id: String,
        address: String,
    },

    /// Direct liveness probe
    Ping,

    /// Probe answer
    Pong {
        node_id: String,
    },

    // ========== Election ==========
    /// Bully challenge sent to every higher peer
    StartElection {
        sender_id: String,
    },

    /// A higher peer takes over the election
    ElectionOk {
        sender_id: String,
    },

    /// Announcement of the new coordinator
    CoordinatorElected {
        coordinator_id: String,
    },

    // ========== Status ==========
    /// Status request
    StatusRequest,

    /// Status response
    StatusResponse {
        node_id: String,
        state: NodeState,
        coordinator: Option<String>,
        peers: Vec<String>,
    },

    // ========== Directory ==========
    /// Register a name in the directory
    Register {
        id: String,
        address: String,
    },

    /// Resolve a single name
    Lookup {
        id: String,
    },

    /// Lookup result
    LookupResponse {
        address: Option<String>,
    },

    /// List every name under a prefix
    List {
        prefix: String,
    },

    /// List result
    ListResponse {
        entries: Vec<(String, String)>,
    },

    // ========== Generic ==========
    /// Acknowledgement for one-way calls
    Ack,

    /// Error response
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Frame or body could not be decoded
    InvalidMessage,
    /// Valid message the receiver does not serve
    Unsupported,
    /// Receiver is shutting down
    ShuttingDown,
    /// Internal error
    Internal,
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::InvalidMessage(e.to_string()))
    }

    /// Build an error response
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Message::Error {
            code,
            message: message.into(),
        }
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Request { .. } => "Request",
            Message::Reply { .. } => "Reply",
            Message::Heartbeat { .. } => "Heartbeat",
            Message::Ping => "Ping",
            Message::Pong { .. } => "Pong",
            Message::StartElection { .. } => "StartElection",
            Message::ElectionOk { .. } => "ElectionOk",
            Message::CoordinatorElected { .. } => "CoordinatorElected",
            Message::StatusRequest => "StatusRequest",
            Message::StatusResponse { .. } => "StatusResponse",
            Message::Register { .. } => "Register",
            Message::Lookup { .. } => "Lookup",
            Message::LookupResponse { .. } => "LookupResponse",
            Message::List { .. } => "List",
            Message::ListResponse { .. } => "ListResponse",
            Message::Ack => "Ack",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }

    /// Check a received body against this header
    pub fn verify(&self, body: &[u8]) -> Result<()> {
        if crc32fast::hash(body) != self.checksum {
            return Err(Error::InvalidMessage("checksum mismatch".into()));
        }
        Ok(())
    }
}
