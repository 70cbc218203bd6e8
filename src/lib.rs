//! PeerLock - Distributed Mutual Exclusion with Coordinator Election
//!
//! A peer-to-peer node that lets a dynamic group of processes share one
//! resource without a central lock server.
//!
//! # Architecture
//!
//! Every node runs three cooperating protocols over a shared, lock-guarded
//! view of the group:
//!
//! - Ricart–Agrawala mutual exclusion, ordered by Lamport tickets
//! - Heartbeat failure detection with periodic directory reconciliation
//! - Bully election of a coordinator (the highest live id)
//!
//! Peers find each other through a name directory and talk over a small
//! length-prefixed, checksummed TCP protocol. [`network::LocalTransport`]
//! runs whole groups in-process.

pub mod config;
pub mod error;
pub mod protocol;
pub mod network;
pub mod directory;
pub mod state;
pub mod mutex;
pub mod detector;
pub mod election;
pub mod node;

pub use config::PeerLockConfig;
pub use error::{Error, Result};
pub use node::{Node, NodeSettings, NodeStatus};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{PeerLockConfig, RequestTimeoutPolicy};
    pub use crate::error::{Error, Result};
    pub use crate::directory::{InMemoryDirectory, PeerDirectory, RemoteDirectory};
    pub use crate::election::Role;
    pub use crate::mutex::{Grant, NodeState};
    pub use crate::network::{LocalTransport, NetworkClient, NetworkServer, Transport};
    pub use crate::node::{Node, NodeSettings, NodeStatus};
    pub use crate::protocol::Message;
    pub use crate::state::{PeerId, Ticket};
}
