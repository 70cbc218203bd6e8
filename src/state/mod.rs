//! State Management Module
//!
//! All mutable protocol state of a node lives in [`Shared`], behind one
//! node-wide lock. Components copy what they need out of the guard, drop it,
//! talk to peers, and re-acquire it to fold results back in.

mod peers;
mod clock;

pub use peers::{PeerRecord, PeerTable};
pub use clock::{LogicalClock, Ticket};

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::election::ElectionState;
use crate::mutex::MutexState;

/// Unique, lexicographically ordered process identifier
pub type PeerId = String;

/// Node-wide protocol state
#[derive(Debug)]
pub struct Shared {
    pub peers: PeerTable,
    pub clock: LogicalClock,
    pub mutex: MutexState,
    pub election: ElectionState,
}

impl Shared {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            peers: PeerTable::new(local_id),
            clock: LogicalClock::new(),
            mutex: MutexState::new(),
            election: ElectionState::new(),
        }
    }
}

/// Handle to the node-wide lock
pub type SharedState = Arc<Mutex<Shared>>;

/// Create the shared state for a node
pub fn shared_state(local_id: impl Into<PeerId>) -> SharedState {
    Arc::new(Mutex::new(Shared::new(local_id.into())))
}
