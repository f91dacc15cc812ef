//! In-process transport fabric
//!
//! Connects routers inside one process over crossed channels, standing in
//! for Bluetooth/Wi-Fi/TCP modules in tests and simulations. Peers attach a
//! listener, addresses dial through the shared registry, and `link`/`unlink`
//! drive discovery events for scripted topologies.

use crate::error::{MeshError, Result};
use crate::network::{
    Address, CloseReason, ConnectionEvent, MeshConnection, Transport, UnderlyingConnection,
};
use crate::routing::{PeerId, TransportEvents};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Monotone source for address identities
static NEXT_ADDRESS_KEY: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct Fabric {
    listeners: DashMap<PeerId, TransportEvents>,
    links: DashMap<(PeerId, PeerId), u64>,
}

/// Shared in-process fabric: who is listening, and which scripted links
/// exist. Cheap to clone; all clones see the same registry.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    fabric: Arc<Fabric>,
}

impl MemoryNetwork {
    /// Create an empty fabric
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer's listener; inbound dials are delivered through it
    pub fn attach(&self, peer: PeerId, events: TransportEvents) {
        self.fabric.listeners.insert(peer, events);
    }

    /// Remove a peer's listener; subsequent dials to it fail
    pub fn detach(&self, peer: &PeerId) {
        self.fabric.listeners.remove(peer);
    }

    /// An address that dials `target` through this fabric
    pub fn address_of(&self, target: PeerId, cost: u32) -> Arc<MemoryAddress> {
        Arc::new(MemoryAddress {
            network: self.clone(),
            target,
            cost,
            key: NEXT_ADDRESS_KEY.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Script a symmetric discovery: each side learns an address for the
    /// other at the given cost. Both peers must be attached.
    pub fn link(&self, a: PeerId, b: PeerId, cost: u32) {
        let addr_of_b = self.address_of(b, cost);
        let addr_of_a = self.address_of(a, cost);
        self.fabric.links.insert((a, b), addr_of_b.key);
        self.fabric.links.insert((b, a), addr_of_a.key);
        if let Some(events) = self.fabric.listeners.get(&a) {
            events.address_discovered(b, addr_of_b);
        }
        if let Some(events) = self.fabric.listeners.get(&b) {
            events.address_discovered(a, addr_of_a);
        }
    }

    /// Retract a scripted link: each side loses the address it learned
    pub fn unlink(&self, a: PeerId, b: PeerId) {
        if let Some((_, key)) = self.fabric.links.remove(&(a, b)) {
            if let Some(events) = self.fabric.listeners.get(&a) {
                events.address_lost(b, key);
            }
        }
        if let Some((_, key)) = self.fabric.links.remove(&(b, a)) {
            if let Some(events) = self.fabric.listeners.get(&b) {
                events.address_lost(a, key);
            }
        }
    }
}

/// Address of one peer on a [`MemoryNetwork`]
pub struct MemoryAddress {
    network: MemoryNetwork,
    target: PeerId,
    cost: u32,
    key: u64,
}

impl Address for MemoryAddress {
    fn cost(&self) -> u32 {
        self.cost
    }

    fn key(&self) -> u64 {
        self.key
    }

    fn open(&self) -> MeshConnection {
        let (near, far) = MemoryConnection::pair();
        *near.dial.lock() = Some(Dial {
            network: self.network.clone(),
            target: self.target,
            remote: far,
        });
        near
    }
}

/// Pending rendezvous carried by an address-opened connection until
/// `connect` delivers the far half to the listener.
struct Dial {
    network: MemoryNetwork,
    target: PeerId,
    remote: Arc<MemoryConnection>,
}

/// One half of a crossed-channel byte stream.
pub struct MemoryConnection {
    to_peer: mpsc::UnboundedSender<ConnectionEvent>,
    local_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    closed: AtomicBool,
    dial: Mutex<Option<Dial>>,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection").finish_non_exhaustive()
    }
}

impl MemoryConnection {
    /// A connected pair of halves; what one writes, the other receives.
    pub fn pair() -> (Arc<MemoryConnection>, Arc<MemoryConnection>) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a = Arc::new(MemoryConnection {
            to_peer: tx_b.clone(),
            local_tx: tx_a.clone(),
            events_rx: Mutex::new(Some(rx_a)),
            closed: AtomicBool::new(false),
            dial: Mutex::new(None),
        });
        let b = Arc::new(MemoryConnection {
            to_peer: tx_a,
            local_tx: tx_b,
            events_rx: Mutex::new(Some(rx_b)),
            closed: AtomicBool::new(false),
            dial: Mutex::new(None),
        });
        (a, b)
    }
}

#[async_trait]
impl UnderlyingConnection for MemoryConnection {
    async fn connect(&self) -> Result<()> {
        let dial = self.dial.lock().take();
        match dial {
            Some(dial) => match dial.network.fabric.listeners.get(&dial.target) {
                Some(events) => {
                    events.incoming_connection(dial.remote);
                    Ok(())
                }
                None => {
                    self.closed.store(true, Ordering::SeqCst);
                    Err(MeshError::TransportClosed)
                }
            },
            // Pair-constructed halves are born connected.
            None => Ok(()),
        }
    }

    async fn write(&self, bytes: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::TransportClosed);
        }
        self.to_peer
            .send(ConnectionEvent::Data(bytes))
            .map_err(|_| MeshError::TransportClosed)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events_rx.lock().take()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self
            .to_peer
            .send(ConnectionEvent::Closed(CloseReason::Remote));
        let _ = self
            .local_tx
            .send(ConnectionEvent::Closed(CloseReason::Local));
    }
}

/// [`Transport`] implementation backed by a [`MemoryNetwork`]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: PeerId,
}

impl MemoryTransport {
    /// A transport module for `local` on the given fabric
    pub fn new(network: MemoryNetwork, local: PeerId) -> Self {
        Self { network, local }
    }
}

impl Transport for MemoryTransport {
    fn start(&self, events: TransportEvents) {
        self.network.attach(self.local, events);
    }

    fn stop(&self) {
        self.network.detach(&self.local);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_exchanges_bytes_both_ways() {
        let (a, b) = MemoryConnection::pair();
        let mut a_rx = a.take_events().unwrap();
        let mut b_rx = b.take_events().unwrap();

        a.write(Bytes::from_static(b"ping")).await.unwrap();
        b.write(Bytes::from_static(b"pong")).await.unwrap();

        match b_rx.recv().await {
            Some(ConnectionEvent::Data(bytes)) => assert_eq!(&bytes[..], b"ping"),
            other => panic!("unexpected {:?}", other),
        }
        match a_rx.recv().await {
            Some(ConnectionEvent::Data(bytes)) => assert_eq!(&bytes[..], b"pong"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn close_notifies_both_sides() {
        let (a, b) = MemoryConnection::pair();
        let mut a_rx = a.take_events().unwrap();
        let mut b_rx = b.take_events().unwrap();

        a.close();
        assert!(matches!(
            a_rx.recv().await,
            Some(ConnectionEvent::Closed(CloseReason::Local))
        ));
        assert!(matches!(
            b_rx.recv().await,
            Some(ConnectionEvent::Closed(CloseReason::Remote))
        ));
        assert!(a.write(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn dial_to_absent_listener_fails() {
        let network = MemoryNetwork::new();
        let address = network.address_of(PeerId::random(), 1);
        let connection = address.open();
        assert!(connection.connect().await.is_err());
    }

    #[test]
    fn address_keys_are_unique() {
        let network = MemoryNetwork::new();
        let target = PeerId::random();
        let a = network.address_of(target, 1);
        let b = network.address_of(target, 1);
        assert_ne!(a.key(), b.key());
        assert_eq!(a.cost(), 1);
    }
}
