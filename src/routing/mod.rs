//! Link-state routing: peer identity, topology graph, flooding, and the
//! router that ties them to connection establishment.

mod establish;
mod flooding;
mod peer;
mod router;
mod scheduler;
mod table;
mod tree;

pub use flooding::{FloodHandler, FloodOutcome, FloodingManager};
pub use peer::Peer;
pub use router::{Router, RouterBuilder, RouterDelegate, TransportEvents};
pub use scheduler::RepeatedExecutor;
pub use table::{LinkStateTable, Route, RoutingTableChange};
pub use tree::HopTree;

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 128-bit peer identifier, totally ordered for tie-breaking.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Generate a fresh random identifier
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Construct from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Raw byte view
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form: the first four bytes are plenty in logs.
        let b = self.0.as_bytes();
        write!(f, "{:02x}{:02x}{:02x}{:02x}", b[0], b[1], b[2], b[3])
    }
}

/// Identifier tagging one in-flight stream through the connection layer.
///
/// Assigned by the transfer layer above; the connection layer treats it as
/// opaque.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransferId(Uuid);

impl TransferId {
    /// Generate a fresh random identifier
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Debug for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.as_bytes();
        write!(f, "{:02x}{:02x}{:02x}{:02x}", b[0], b[1], b[2], b[3])
    }
}
