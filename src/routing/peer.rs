//! Per-peer state
//!
//! A `Peer` is a long-lived handle: created the first time the peer is
//! mentioned (address discovered, advertisement received, or route
//! computed) and kept for the router's whole life so reachability
//! transitions stay observable across disappearance and rediscovery.

use crate::network::{Address, MeshConnection};
use crate::routing::table::Route;
use crate::routing::PeerId;
use std::sync::Arc;

/// State of the long-lived neighbor link that carries flooding traffic
pub(crate) enum RoutingLink {
    /// No link and none in flight
    Down,
    /// An outbound attempt (possibly a backoff retry) is in flight
    Connecting {
        /// Invalidates stale attempt results after state changes
        generation: u64,
    },
    /// Link is up and readable
    Up {
        /// The live connection
        connection: MeshConnection,
        /// Invalidates stale close notifications
        generation: u64,
        /// Which side opened it, for cross-connection arbitration
        initiator: PeerId,
    },
}

/// What an address mutation changed about the peer
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct AddressChange {
    /// The peer went from zero addresses to at least one
    pub became_neighbor: bool,
    /// The peer's last address was removed
    pub lost_neighbor: bool,
    /// The minimum-cost address is a different one (or has different cost)
    pub best_changed: bool,
}

/// One peer of the mesh as seen by the local router.
pub struct Peer {
    id: PeerId,
    addresses: Vec<Arc<dyn Address>>,
    pub(crate) reachable_via: Option<Route>,
    pub(crate) link: RoutingLink,
    pub(crate) link_attempts: u32,
    generation: u64,
}

impl Peer {
    pub(crate) fn new(id: PeerId) -> Self {
        Self {
            id,
            addresses: Vec::new(),
            reachable_via: None,
            link: RoutingLink::Down,
            link_attempts: 0,
            generation: 0,
        }
    }

    /// This peer's identifier
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Whether at least one address is known (neighborship is strictly a
    /// local observation, independent of graph-derived reachability)
    pub fn is_neighbor(&self) -> bool {
        !self.addresses.is_empty()
    }

    /// Current route from the local peer, if any
    pub fn reachable_via(&self) -> Option<Route> {
        self.reachable_via
    }

    /// Minimum-cost address; ties break on the stable address key
    pub fn best_address(&self) -> Option<Arc<dyn Address>> {
        self.addresses
            .iter()
            .min_by_key(|a| (a.cost(), a.key()))
            .cloned()
    }

    /// Record a discovered address. An address with a known key replaces
    /// the previous instance.
    pub(crate) fn add_address(&mut self, address: Arc<dyn Address>) -> AddressChange {
        let was_neighbor = self.is_neighbor();
        let best_before = self.best_key();
        self.addresses.retain(|a| a.key() != address.key());
        self.addresses.push(address);
        AddressChange {
            became_neighbor: !was_neighbor,
            lost_neighbor: false,
            best_changed: self.best_key() != best_before,
        }
    }

    /// Forget an address by key.
    pub(crate) fn remove_address(&mut self, key: u64) -> AddressChange {
        let was_neighbor = self.is_neighbor();
        let best_before = self.best_key();
        self.addresses.retain(|a| a.key() != key);
        AddressChange {
            became_neighbor: false,
            lost_neighbor: was_neighbor && !self.is_neighbor(),
            best_changed: self.best_key() != best_before,
        }
    }

    /// Drop every known address (routing link gave up on this peer).
    pub(crate) fn clear_addresses(&mut self) -> AddressChange {
        let was_neighbor = self.is_neighbor();
        self.addresses.clear();
        AddressChange {
            became_neighbor: false,
            lost_neighbor: was_neighbor,
            best_changed: was_neighbor,
        }
    }

    /// Advance the link generation, invalidating in-flight attempt results.
    pub(crate) fn bump_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Whether `generation` is the current link generation.
    pub(crate) fn generation_is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// The routing link connection, if up.
    pub(crate) fn routing_connection(&self) -> Option<&MeshConnection> {
        match &self.link {
            RoutingLink::Up { connection, .. } => Some(connection),
            _ => None,
        }
    }

    fn best_key(&self) -> Option<(u32, u64)> {
        self.addresses
            .iter()
            .map(|a| (a.cost(), a.key()))
            .min()
    }
}
