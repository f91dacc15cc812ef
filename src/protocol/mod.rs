//! Control-plane packet model
//!
//! Every control packet is a length-prefixed frame (16-bit big-endian length,
//! excluding the prefix) whose body starts with a 16-bit type tag. Framing is
//! used only for control traffic: once a routed connection is confirmed, the
//! stream carries raw application bytes.

mod wire;

pub use wire::{decode_packet, encode_packet, FrameBuffer};

use crate::error::WireError;
use crate::routing::{HopTree, PeerId};

/// Link handshake
pub const TAG_LINK_HANDSHAKE: u16 = 0x0001;
/// Multicast handshake carrying the next-hop subtree
pub const TAG_MULTICAST_HANDSHAKE: u16 = 0x0002;
/// Routed-connection-established confirmation
pub const TAG_ESTABLISHED: u16 = 0x0003;
/// Link-state advertisement
pub const TAG_LINK_STATE: u16 = 0x0010;
/// Flooding envelope wrapping an inner packet
pub const TAG_FLOOD: u16 = 0x0020;

/// Declared purpose of a freshly opened direct connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPurpose {
    /// Long-lived neighbor link carrying flooding traffic
    Routing = 1,
    /// One hop of a routed or multicast path
    Routed = 2,
}

impl TryFrom<u8> for LinkPurpose {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            1 => Ok(LinkPurpose::Routing),
            2 => Ok(LinkPurpose::Routed),
            other => Err(WireError::InvalidField {
                field: "purpose",
                reason: format!("unknown purpose {}", other),
            }),
        }
    }
}

/// A decoded control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// First packet on any direct connection: who is calling and why
    LinkHandshake {
        /// Identity of the connecting peer
        peer: PeerId,
        /// What the connection will carry
        purpose: LinkPurpose,
    },

    /// Second packet on a routed hop: the plan for the rest of the path
    MulticastHandshake {
        /// Peer that initiated the multicast
        source: PeerId,
        /// Terminal destinations of the whole multicast
        destinations: Vec<PeerId>,
        /// Subtree this hop is responsible for
        route: HopTree,
    },

    /// Endpoint confirmation exchanged after the path is wired
    Established {
        /// Peer confirming its end
        source: PeerId,
    },

    /// One node's current neighbor list with costs, flooded mesh-wide
    LinkState {
        /// Advertising peer
        origin: PeerId,
        /// `(neighbor, cost)` pairs; the advertiser's full outgoing edge set
        neighbors: Vec<(PeerId, u32)>,
    },

    /// Flooding envelope: dedup key plus an inner packet
    Flood {
        /// Peer that first flooded the inner packet
        origin: PeerId,
        /// Monotone per-origin sequence number
        sequence: u32,
        /// The wrapped packet (never itself a `Flood`)
        inner: Box<Packet>,
    },
}

impl Packet {
    /// Wire type tag for this packet
    pub fn tag(&self) -> u16 {
        match self {
            Packet::LinkHandshake { .. } => TAG_LINK_HANDSHAKE,
            Packet::MulticastHandshake { .. } => TAG_MULTICAST_HANDSHAKE,
            Packet::Established { .. } => TAG_ESTABLISHED,
            Packet::LinkState { .. } => TAG_LINK_STATE,
            Packet::Flood { .. } => TAG_FLOOD,
        }
    }
}
