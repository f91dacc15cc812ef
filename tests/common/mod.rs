//! Shared fixtures for integration tests
//!
//! Builds routers on an in-process fabric with short timers, plus a
//! recording delegate and polling helpers for convergence assertions.

use bytes::Bytes;
use meshwork::network::memory::MemoryNetwork;
use meshwork::{
    ConnectionEvent, MeshConnection, PeerId, Route, Router, RouterConfig, RouterDelegate,
    UnderlyingConnection,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

/// How long convergence polls wait before giving up
pub const CONVERGE_DEADLINE: Duration = Duration::from_secs(5);

/// Timer settings small enough for tests to converge quickly
pub fn fast_config() -> RouterConfig {
    RouterConfig {
        broadcast_interval: Duration::from_millis(200),
        coalesce_delay: Duration::from_millis(25),
        routing_retry_limit: 3,
        handshake_timeout: Duration::from_secs(2),
    }
}

/// Deterministic peer id so lexicographic tie-breaks are scripted
pub fn peer(n: u8) -> PeerId {
    PeerId::from_bytes([n; 16])
}

/// Reachability notifications observed by one router's delegate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reachability {
    Found(PeerId),
    Lost(PeerId),
    Improved(PeerId),
}

/// Delegate that records notifications and forwards inbound connections
pub struct RecordingDelegate {
    pub reachability: Mutex<Vec<Reachability>>,
    connections: mpsc::UnboundedSender<(PeerId, MeshConnection)>,
}

impl RecordingDelegate {
    pub fn new() -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<(PeerId, MeshConnection)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                reachability: Mutex::new(Vec::new()),
                connections: tx,
            }),
            rx,
        )
    }

    pub fn found(&self, peer: PeerId) -> bool {
        self.reachability
            .lock()
            .iter()
            .any(|e| *e == Reachability::Found(peer))
    }

    pub fn found_count(&self, peer: PeerId) -> usize {
        self.reachability
            .lock()
            .iter()
            .filter(|e| **e == Reachability::Found(peer))
            .count()
    }
}

impl RouterDelegate for RecordingDelegate {
    fn did_find_peer(&self, peer: PeerId, _route: Route) {
        self.reachability.lock().push(Reachability::Found(peer));
    }

    fn did_lose_peer(&self, peer: PeerId) {
        self.reachability.lock().push(Reachability::Lost(peer));
    }

    fn did_improve_route(&self, peer: PeerId, _route: Route) {
        self.reachability.lock().push(Reachability::Improved(peer));
    }

    fn handle_connection(&self, source: PeerId, connection: MeshConnection) {
        let _ = self.connections.send((source, connection));
    }
}

/// One router attached to the shared fabric
pub struct MeshNode {
    pub router: Router,
    pub delegate: Arc<RecordingDelegate>,
    pub inbound: mpsc::UnboundedReceiver<(PeerId, MeshConnection)>,
}

/// Install a subscriber once so `RUST_LOG=meshwork=debug` surfaces router
/// tracing from failing tests
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Build a router with the given id and attach it to the fabric
pub fn mesh_node(network: &MemoryNetwork, id: PeerId) -> MeshNode {
    init_tracing();
    let (delegate, inbound) = RecordingDelegate::new();
    let router = Router::builder()
        .local_id(id)
        .config(fast_config())
        .delegate(Arc::clone(&delegate) as Arc<dyn RouterDelegate>)
        .build();
    network.attach(id, router.transport_events());
    MeshNode {
        router,
        delegate,
        inbound,
    }
}

/// Poll until the router has a route to `peer`
pub async fn wait_for_route(router: &Router, peer: PeerId) -> Route {
    let deadline = Instant::now() + CONVERGE_DEADLINE;
    loop {
        if let Ok(Some(route)) = router.route_to(peer).await {
            return route;
        }
        assert!(
            Instant::now() < deadline,
            "no route to {:?} within deadline",
            peer
        );
        sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until the route to `peer` uses the expected next hop
pub async fn wait_for_next_hop(router: &Router, peer: PeerId, next_hop: PeerId) -> Route {
    let deadline = Instant::now() + CONVERGE_DEADLINE;
    loop {
        if let Ok(Some(route)) = router.route_to(peer).await {
            if route.next_hop == next_hop {
                return route;
            }
        }
        assert!(
            Instant::now() < deadline,
            "route to {:?} never moved to next hop {:?}",
            peer,
            next_hop
        );
        sleep(Duration::from_millis(20)).await;
    }
}

/// Await the next inbound connection delivered to a delegate
pub async fn expect_inbound(
    inbound: &mut mpsc::UnboundedReceiver<(PeerId, MeshConnection)>,
) -> (PeerId, MeshConnection) {
    timeout(CONVERGE_DEADLINE, inbound.recv())
        .await
        .expect("timed out awaiting inbound connection")
        .expect("inbound channel closed")
}

/// Accumulate exactly `n` bytes off a connection's event stream
pub async fn read_exact(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>, n: usize) -> Bytes {
    let mut collected = Vec::with_capacity(n);
    while collected.len() < n {
        let event = timeout(CONVERGE_DEADLINE, rx.recv())
            .await
            .expect("timed out awaiting data")
            .expect("event stream ended");
        match event {
            ConnectionEvent::Data(bytes) => collected.extend_from_slice(&bytes),
            ConnectionEvent::Closed(reason) => {
                panic!("connection closed ({:?}) with {} bytes", reason, collected.len())
            }
        }
    }
    assert_eq!(collected.len(), n, "received more bytes than expected");
    Bytes::from(collected)
}

/// Take the event stream of a connection, panicking if already taken
pub fn events_of(connection: &MeshConnection) -> mpsc::UnboundedReceiver<ConnectionEvent> {
    connection.take_events().expect("events already taken")
}
