//! Error types for meshwork

use crate::routing::PeerId;
use thiserror::Error;

/// Errors produced by the wire codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Frame ended before the announced length was available
    #[error("truncated frame: needed {needed} more bytes")]
    Truncated {
        /// How many additional bytes the decoder expected
        needed: usize,
    },

    /// Packet type tag is not one this crate speaks
    #[error("unknown packet tag {0:#06x}")]
    UnknownTag(u16),

    /// A field carried a value outside its valid range
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        /// Name of the offending field
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// Encoded packet would not fit in a 16-bit length prefix
    #[error("packet too large: {0} bytes")]
    Oversized(usize),
}

/// Main error type for meshwork operations
#[derive(Debug, Error)]
pub enum MeshError {
    /// Attempted to connect to a peer with no known addresses
    #[error("peer {0} has no known addresses")]
    NoAddress(PeerId),

    /// The routing table has no path to one or more destinations
    #[error("no route to {0:?}")]
    NoRoute(Vec<PeerId>),

    /// An expected handshake packet was missing, malformed, or mistyped
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// At least one branch of a multicast establishment failed; the whole
    /// composite was torn down
    #[error("multicast establishment failed: {established} of {total} branches up")]
    PartialMulticast {
        /// Branches that were successfully established before the failure
        established: usize,
        /// Total branches required
        total: usize,
    },

    /// The underlying connection closed mid-operation
    #[error("transport closed")]
    TransportClosed,

    /// A handshake step exceeded its deadline
    #[error("operation timed out")]
    Timeout,

    /// Wire codec failure
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The router's dispatch context has shut down
    #[error("router stopped")]
    Stopped,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, MeshError>;
