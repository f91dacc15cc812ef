//! The router: neighbor lifecycle, link-state dissemination, and connection
//! establishment, all behind one serial dispatch context.
//!
//! The public [`Router`] is a cheap cloneable handle. All state lives in a
//! core task that drains a command channel one event at a time; transports,
//! timers, establishment tasks, and user calls enqueue onto it, so within a
//! single event every state transition is atomic.

use crate::config::RouterConfig;
use crate::error::{MeshError, Result};
use crate::network::{
    Address, ConnectionParts, ForkingConnection, MeshConnection, PacketStream,
    UnderlyingConnection,
};
use crate::protocol::{Packet, TAG_LINK_STATE};
use crate::routing::establish::{self, EstablishContext};
use crate::routing::peer::{AddressChange, Peer, RoutingLink};
use crate::routing::table::{LinkStateTable, Route, RoutingTableChange};
use crate::routing::{
    FloodOutcome, FloodingManager, HopTree, PeerId, RepeatedExecutor, TransferId,
};
use bytes::Bytes;
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Notifications from the router to the layer above.
///
/// All calls originate on the router's dispatch context; implementations
/// should stay lightweight and hand heavy work to their own tasks.
pub trait RouterDelegate: Send + Sync {
    /// A previously-unreachable peer became reachable
    fn did_find_peer(&self, _peer: PeerId, _route: Route) {}

    /// A peer transitioned to unreachable
    fn did_lose_peer(&self, _peer: PeerId) {}

    /// The cost of the route to a peer strictly decreased
    fn did_improve_route(&self, _peer: PeerId, _route: Route) {}

    /// An inbound routed/multicast connection finished its handshake with
    /// the local endpoint
    fn handle_connection(&self, source: PeerId, connection: MeshConnection);
}

/// Event sink handed to transport modules.
#[derive(Clone)]
pub struct TransportEvents {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl TransportEvents {
    /// A transport discovered an address for a peer
    pub fn address_discovered(&self, peer: PeerId, address: Arc<dyn Address>) {
        let _ = self.cmd_tx.send(Command::AddressDiscovered { peer, address });
    }

    /// A previously discovered address is gone
    pub fn address_lost(&self, peer: PeerId, address_key: u64) {
        let _ = self.cmd_tx.send(Command::AddressLost {
            peer,
            key: address_key,
        });
    }

    /// A remote peer opened a raw connection to us
    pub fn incoming_connection(&self, connection: MeshConnection) {
        let _ = self.cmd_tx.send(Command::IncomingConnection { connection });
    }
}

/// Commands processed by the router core, one at a time.
pub(crate) enum Command {
    AddressDiscovered {
        peer: PeerId,
        address: Arc<dyn Address>,
    },
    AddressLost {
        peer: PeerId,
        key: u64,
    },
    IncomingConnection {
        connection: MeshConnection,
    },
    EstablishMulticast {
        destinations: BTreeSet<PeerId>,
        reply: oneshot::Sender<Result<MeshConnection>>,
    },
    Broadcast,
    FloodReceived {
        from: PeerId,
        envelope: Packet,
    },
    LinkStateReceived {
        origin: PeerId,
        neighbors: Vec<(PeerId, u32)>,
    },
    RoutingOutboundUp {
        peer: PeerId,
        generation: u64,
        parts: ConnectionParts,
    },
    RoutingOutboundFailed {
        peer: PeerId,
        generation: u64,
    },
    RetryRoutingLink {
        peer: PeerId,
        generation: u64,
    },
    RoutingInbound {
        peer: PeerId,
        parts: ConnectionParts,
    },
    RoutingLinkClosed {
        peer: PeerId,
        generation: u64,
    },
    StartForwarding {
        source: PeerId,
        destinations: Vec<PeerId>,
        route: HopTree,
        incoming: ConnectionParts,
    },
    ForwardReady {
        token: TransferId,
        source: PeerId,
        destinations: Vec<PeerId>,
        incoming: ConnectionParts,
        outgoing: ConnectionParts,
    },
    ForwardFailed {
        token: TransferId,
    },
    TerminalReady {
        source: PeerId,
        connection: MeshConnection,
    },
    ForkingClosed {
        token: TransferId,
    },
    Neighbors {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    RouteTo {
        peer: PeerId,
        reply: oneshot::Sender<Option<Route>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Builder for [`Router`] instances
///
/// ```no_run
/// use meshwork::{Router, RouterConfig, RouterDelegate, MeshConnection, PeerId};
/// use std::sync::Arc;
///
/// struct App;
/// impl RouterDelegate for App {
///     fn handle_connection(&self, _source: PeerId, _connection: MeshConnection) {}
/// }
///
/// # async fn example() {
/// let router = Router::builder()
///     .config(RouterConfig::default())
///     .delegate(Arc::new(App))
///     .build();
/// # }
/// ```
pub struct RouterBuilder {
    local: Option<PeerId>,
    config: RouterConfig,
    delegate: Option<Arc<dyn RouterDelegate>>,
}

impl RouterBuilder {
    /// Start from defaults: random identity, default config
    pub fn new() -> Self {
        Self {
            local: None,
            config: RouterConfig::default(),
            delegate: None,
        }
    }

    /// Use a fixed local identity instead of a random one
    pub fn local_id(mut self, id: PeerId) -> Self {
        self.local = Some(id);
        self
    }

    /// Override the default configuration
    pub fn config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the delegate receiving reachability and connection events
    pub fn delegate(mut self, delegate: Arc<dyn RouterDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Spawn the router core. Must be called inside a tokio runtime.
    ///
    /// Without a delegate, reachability events are dropped and inbound
    /// connections are closed.
    pub fn build(self) -> Router {
        let local = self.local.unwrap_or_else(PeerId::random);
        let delegate = self
            .delegate
            .unwrap_or_else(|| Arc::new(ClosingDelegate));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let executor = {
            let tx = cmd_tx.clone();
            RepeatedExecutor::spawn(
                self.config.broadcast_interval,
                self.config.coalesce_delay,
                move || {
                    let _ = tx.send(Command::Broadcast);
                },
            )
        };

        let mut flooding = FloodingManager::new(local);
        {
            let tx = cmd_tx.clone();
            flooding.register(
                TAG_LINK_STATE,
                Box::new(move |_, packet| {
                    if let Packet::LinkState { origin, neighbors } = packet {
                        let _ = tx.send(Command::LinkStateReceived {
                            origin: *origin,
                            neighbors: neighbors.clone(),
                        });
                    }
                }),
            );
        }

        let core = RouterCore {
            local,
            config: self.config,
            delegate,
            cmd_tx: cmd_tx.clone(),
            peers: HashMap::new(),
            table: LinkStateTable::new(local),
            flooding,
            executor,
            forking: HashMap::new(),
            pending_forwarded: HashMap::new(),
        };
        tokio::spawn(core.run(cmd_rx));

        info!(%local, "router started");
        Router { local, cmd_tx }
    }
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Fallback delegate: refuse inbound connections
struct ClosingDelegate;

impl RouterDelegate for ClosingDelegate {
    fn handle_connection(&self, _source: PeerId, connection: MeshConnection) {
        connection.close();
    }
}

/// Handle to a running router core.
#[derive(Clone)]
pub struct Router {
    local: PeerId,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Router {
    /// Start configuring a new router
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    /// The local peer's identifier
    pub fn local_id(&self) -> PeerId {
        self.local
    }

    /// Event sink for wiring transport modules to this router
    pub fn transport_events(&self) -> TransportEvents {
        TransportEvents {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Establish a one-to-many connection to every destination.
    ///
    /// Resolves once every destination has confirmed, with one composite
    /// connection fanning writes out across the hop tree. All-or-nothing:
    /// on any failure no connection remains open.
    pub async fn establish_multicast(
        &self,
        destinations: BTreeSet<PeerId>,
    ) -> Result<MeshConnection> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::EstablishMulticast {
                destinations,
                reply,
            })
            .map_err(|_| MeshError::Stopped)?;
        rx.await.map_err(|_| MeshError::Stopped)?
    }

    /// Establish a connection to a single peer (a multicast of one)
    pub async fn establish_connection(&self, peer: PeerId) -> Result<MeshConnection> {
        self.establish_multicast([peer].into_iter().collect()).await
    }

    /// Peers currently holding at least one known address
    pub async fn neighbors(&self) -> Result<Vec<PeerId>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Neighbors { reply })
            .map_err(|_| MeshError::Stopped)?;
        rx.await.map_err(|_| MeshError::Stopped)
    }

    /// Current route to a peer, if the routing table has one
    pub async fn route_to(&self, peer: PeerId) -> Result<Option<Route>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::RouteTo { peer, reply })
            .map_err(|_| MeshError::Stopped)?;
        rx.await.map_err(|_| MeshError::Stopped)
    }

    /// Shut the router down: close every retained connection and stop the
    /// dispatch context.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Loop control for the core
#[derive(PartialEq)]
enum Flow {
    Continue,
    Stop,
}

struct RouterCore {
    local: PeerId,
    config: RouterConfig,
    delegate: Arc<dyn RouterDelegate>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    peers: HashMap<PeerId, Peer>,
    table: LinkStateTable,
    flooding: FloodingManager,
    executor: RepeatedExecutor,
    forking: HashMap<TransferId, Arc<ForkingConnection>>,
    pending_forwarded: HashMap<TransferId, MeshConnection>,
}

impl RouterCore {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = cmd_rx.recv().await {
            if self.handle(command) == Flow::Stop {
                break;
            }
        }
        self.shutdown();
    }

    fn handle(&mut self, command: Command) -> Flow {
        match command {
            Command::AddressDiscovered { peer, address } => {
                self.on_address_discovered(peer, address)
            }
            Command::AddressLost { peer, key } => self.on_address_lost(peer, key),
            Command::IncomingConnection { connection } => {
                tokio::spawn(establish::handle_inbound(self.context(), connection));
            }
            Command::EstablishMulticast {
                destinations,
                reply,
            } => self.on_establish_multicast(destinations, reply),
            Command::Broadcast => self.broadcast_link_state(),
            Command::FloodReceived { from, envelope } => self.on_flood_received(from, envelope),
            Command::LinkStateReceived { origin, neighbors } => {
                let change = self.table.link_state_update(origin, &neighbors);
                self.apply_change(change);
            }
            Command::RoutingOutboundUp {
                peer,
                generation,
                parts,
            } => self.on_routing_outbound_up(peer, generation, parts),
            Command::RoutingOutboundFailed { peer, generation } => {
                self.on_routing_outbound_failed(peer, generation)
            }
            Command::RetryRoutingLink { peer, generation } => {
                self.on_retry_routing_link(peer, generation)
            }
            Command::RoutingInbound { peer, parts } => self.adopt_routing_link(peer, parts, peer),
            Command::RoutingLinkClosed { peer, generation } => {
                self.on_routing_link_closed(peer, generation)
            }
            Command::StartForwarding {
                source,
                destinations,
                route,
                incoming,
            } => self.on_start_forwarding(source, destinations, route, incoming),
            Command::ForwardReady {
                token,
                source,
                destinations,
                incoming,
                outgoing,
            } => self.on_forward_ready(token, source, destinations, incoming, outgoing),
            Command::ForwardFailed { token } => {
                self.pending_forwarded.remove(&token);
            }
            Command::TerminalReady { source, connection } => {
                self.provide_peer(source);
                debug!(%source, "inbound connection delivered");
                self.delegate.handle_connection(source, connection);
            }
            Command::ForkingClosed { token } => {
                self.forking.remove(&token);
            }
            Command::Neighbors { reply } => {
                let neighbors = self
                    .peers
                    .values()
                    .filter(|p| p.is_neighbor())
                    .map(|p| p.id())
                    .collect();
                let _ = reply.send(neighbors);
            }
            Command::RouteTo { peer, reply } => {
                let _ = reply.send(self.table.route_to(&peer));
            }
            Command::Stop { reply } => {
                let _ = reply.send(());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn context(&self) -> EstablishContext {
        EstablishContext {
            local: self.local,
            step_timeout: self.config.handshake_timeout,
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    fn provide_peer(&mut self, id: PeerId) -> &mut Peer {
        self.peers.entry(id).or_insert_with(|| Peer::new(id))
    }

    // ── neighbor lifecycle ──

    fn on_address_discovered(&mut self, peer_id: PeerId, address: Arc<dyn Address>) {
        if peer_id == self.local {
            return;
        }
        let peer = self.provide_peer(peer_id);
        let change = peer.add_address(address);
        if change.became_neighbor {
            info!(peer = %peer_id, "neighbor reachable");
        }
        self.after_address_change(peer_id, change);
        self.ensure_routing_link(peer_id);
    }

    fn on_address_lost(&mut self, peer_id: PeerId, key: u64) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        let change = peer.remove_address(key);
        if change.lost_neighbor {
            info!(peer = %peer_id, "neighbor lost");
            self.drop_routing_link(peer_id);
        }
        self.after_address_change(peer_id, change);
    }

    /// Propagate an address-set mutation into the routing table and the
    /// broadcast schedule.
    fn after_address_change(&mut self, peer_id: PeerId, change: AddressChange) {
        if change.lost_neighbor {
            let delta = self.table.neighbor_removal(peer_id);
            self.apply_change(delta);
            self.executor.trigger_short();
        } else if change.became_neighbor || change.best_changed {
            let Some(cost) = self
                .peers
                .get(&peer_id)
                .and_then(|p| p.best_address())
                .map(|a| a.cost())
            else {
                return;
            };
            let delta = self.table.neighbor_update(peer_id, cost);
            self.apply_change(delta);
            self.executor.trigger_short();
        }
    }

    // ── routing metadata link ──

    fn ensure_routing_link(&mut self, peer_id: PeerId) {
        let ctx = self.context();
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        if !peer.is_neighbor() || !matches!(peer.link, RoutingLink::Down) {
            return;
        }
        let Some(address) = peer.best_address() else {
            return;
        };
        let generation = peer.bump_generation();
        peer.link = RoutingLink::Connecting { generation };
        peer.link_attempts = 0;
        tokio::spawn(establish::attempt_routing_link(
            ctx, peer_id, address, generation,
        ));
    }

    fn on_routing_outbound_up(
        &mut self,
        peer_id: PeerId,
        generation: u64,
        parts: ConnectionParts,
    ) {
        let stale = self
            .peers
            .get(&peer_id)
            .map(|p| !p.generation_is_current(generation))
            .unwrap_or(true);
        if stale {
            parts.connection.close();
            return;
        }
        self.adopt_routing_link(peer_id, parts, self.local);
    }

    /// Install a routing link, arbitrating cross connections: when both
    /// sides dialed simultaneously, the link opened by the smaller PeerId
    /// survives.
    fn adopt_routing_link(&mut self, peer_id: PeerId, parts: ConnectionParts, initiator: PeerId) {
        if peer_id == self.local {
            parts.connection.close();
            return;
        }
        let local = self.local;
        let ctx = self.context();
        let peer = self.provide_peer(peer_id);

        if let RoutingLink::Up {
            initiator: existing,
            connection,
            ..
        } = &peer.link
        {
            let winner = std::cmp::min(local, peer_id);
            if *existing == winner && initiator != winner {
                debug!(peer = %peer_id, "dropping losing cross connection");
                parts.connection.close();
                return;
            }
            connection.close();
        }

        let generation = peer.bump_generation();
        peer.link = RoutingLink::Up {
            connection: Arc::clone(&parts.connection),
            generation,
            initiator,
        };
        peer.link_attempts = 0;
        debug!(peer = %peer_id, inbound = initiator == peer_id, "routing link up");

        let ConnectionParts {
            events, leftover, ..
        } = parts;
        tokio::spawn(establish::routing_reader(
            ctx,
            peer_id,
            generation,
            PacketStream::resume(events, leftover),
        ));

        // Let the new neighbor hear our current link state promptly.
        self.executor.trigger_short();
    }

    fn on_routing_outbound_failed(&mut self, peer_id: PeerId, generation: u64) {
        let coalesce = self.config.coalesce_delay;
        let cap = self.config.broadcast_interval;
        let limit = self.config.routing_retry_limit;
        let cmd_tx = self.cmd_tx.clone();

        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        if !peer.generation_is_current(generation)
            || !matches!(peer.link, RoutingLink::Connecting { .. })
        {
            return;
        }
        peer.link_attempts += 1;
        if peer.link_attempts >= limit {
            warn!(peer = %peer_id, attempts = peer.link_attempts, "routing link given up");
            peer.link = RoutingLink::Down;
            let change = peer.clear_addresses();
            if change.lost_neighbor {
                info!(peer = %peer_id, "neighbor lost");
            }
            self.after_address_change(peer_id, change);
            return;
        }

        // Exponential backoff from the short delay, capped at the regular
        // delay, jittered to keep rediscovery storms apart.
        let exponent = peer.link_attempts.saturating_sub(1).min(16);
        let backoff = coalesce
            .saturating_mul(1u32 << exponent)
            .min(cap);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        let delay = backoff.mul_f64(jitter);
        debug!(peer = %peer_id, attempt = peer.link_attempts, ?delay, "routing link retry scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cmd_tx.send(Command::RetryRoutingLink {
                peer: peer_id,
                generation,
            });
        });
    }

    fn on_retry_routing_link(&mut self, peer_id: PeerId, generation: u64) {
        let ctx = self.context();
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        if !peer.generation_is_current(generation)
            || !matches!(peer.link, RoutingLink::Connecting { .. })
        {
            return;
        }
        match peer.best_address() {
            Some(address) => {
                tokio::spawn(establish::attempt_routing_link(
                    ctx, peer_id, address, generation,
                ));
            }
            None => {
                peer.link = RoutingLink::Down;
            }
        }
    }

    fn on_routing_link_closed(&mut self, peer_id: PeerId, generation: u64) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        if !peer.generation_is_current(generation) {
            return;
        }
        debug!(peer = %peer_id, "routing link closed");
        peer.link = RoutingLink::Down;
        if peer.is_neighbor() {
            self.ensure_routing_link(peer_id);
        }
    }

    fn drop_routing_link(&mut self, peer_id: PeerId) {
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            if let RoutingLink::Up { connection, .. } = &peer.link {
                connection.close();
            }
            peer.bump_generation();
            peer.link = RoutingLink::Down;
        }
    }

    // ── link-state dissemination ──

    fn broadcast_link_state(&mut self) {
        let packet = Packet::LinkState {
            origin: self.local,
            neighbors: self.table.link_state_information(),
        };
        match self.flooding.flood(packet) {
            Ok(frame) => self.send_to_routing_links(frame, None),
            Err(error) => warn!(%error, "failed to encode link-state broadcast"),
        }
    }

    fn on_flood_received(&mut self, from: PeerId, envelope: Packet) {
        match self.flooding.receive(&envelope) {
            Ok(FloodOutcome::Fresh { rebroadcast }) => {
                self.send_to_routing_links(rebroadcast, Some(from));
            }
            Ok(FloodOutcome::Duplicate) => {}
            // A bad envelope must not poison routing state.
            Err(error) => warn!(%from, %error, "invalid flood envelope dropped"),
        }
    }

    fn send_to_routing_links(&self, frame: Bytes, exclude: Option<PeerId>) {
        for (id, peer) in &self.peers {
            if Some(*id) == exclude {
                continue;
            }
            if let Some(connection) = peer.routing_connection() {
                let connection = Arc::clone(connection);
                let frame = frame.clone();
                tokio::spawn(async move {
                    let _ = connection.write(frame).await;
                });
            }
        }
    }

    /// Apply a reachability delta: update peer handles and notify the
    /// delegate exactly once per affected peer.
    fn apply_change(&mut self, change: RoutingTableChange) {
        for (peer_id, route) in change.now_reachable {
            self.provide_peer(peer_id).reachable_via = Some(route);
            debug!(peer = %peer_id, cost = route.cost, "peer reachable");
            self.delegate.did_find_peer(peer_id, route);
        }
        for peer_id in change.now_unreachable {
            self.provide_peer(peer_id).reachable_via = None;
            debug!(peer = %peer_id, "peer unreachable");
            self.delegate.did_lose_peer(peer_id);
        }
        for (peer_id, old, new) in change.route_changed {
            self.provide_peer(peer_id).reachable_via = Some(new);
            if new.cost < old.cost {
                debug!(peer = %peer_id, cost = new.cost, "route improved");
                self.delegate.did_improve_route(peer_id, new);
            }
        }
    }

    // ── connection establishment ──

    fn on_establish_multicast(
        &mut self,
        destinations: BTreeSet<PeerId>,
        reply: oneshot::Sender<Result<MeshConnection>>,
    ) {
        let mut destinations = destinations;
        destinations.remove(&self.local);
        if destinations.is_empty() {
            let _ = reply.send(Err(MeshError::NoRoute(Vec::new())));
            return;
        }
        let tree = match self.table.hop_tree(&destinations) {
            Ok(tree) => tree,
            Err(error) => {
                let _ = reply.send(Err(error));
                return;
            }
        };
        let mut branches = Vec::with_capacity(tree.children.len());
        for child in &tree.children {
            match self
                .peers
                .get(&child.id)
                .and_then(|p| p.best_address())
            {
                Some(address) => branches.push((child.clone(), address)),
                None => {
                    let _ = reply.send(Err(MeshError::NoAddress(child.id)));
                    return;
                }
            }
        }
        debug!(
            destinations = destinations.len(),
            branches = branches.len(),
            "establishing multicast"
        );
        tokio::spawn(establish::run_multicast(
            self.context(),
            destinations,
            branches,
            reply,
        ));
    }

    fn on_start_forwarding(
        &mut self,
        source: PeerId,
        destinations: Vec<PeerId>,
        route: HopTree,
        incoming: ConnectionParts,
    ) {
        let mut children = Vec::with_capacity(route.children.len());
        for child in &route.children {
            match self
                .peers
                .get(&child.id)
                .and_then(|p| p.best_address())
            {
                Some(address) => children.push((child.clone(), address)),
                None => {
                    warn!(%source, next_hop = %child.id, "no address for forwarding hop");
                    incoming.connection.close();
                    return;
                }
            }
        }

        let token = TransferId::random();
        // Retain the incoming connection for as long as its outgoing peers
        // are in flight.
        self.pending_forwarded
            .insert(token, Arc::clone(&incoming.connection));
        debug!(%source, ?token, branches = children.len(), "forwarding");
        tokio::spawn(establish::run_forward(
            self.context(),
            token,
            source,
            destinations,
            children,
            incoming,
        ));
    }

    fn on_forward_ready(
        &mut self,
        token: TransferId,
        source: PeerId,
        destinations: Vec<PeerId>,
        incoming: ConnectionParts,
        outgoing: ConnectionParts,
    ) {
        if !self.pending_forwarded.contains_key(&token) {
            // The router shut down (or dropped the transfer) while branches
            // were coming up.
            incoming.connection.close();
            outgoing.connection.close();
            return;
        }
        let endpoint = destinations.contains(&self.local);
        let ctx = self.context();
        let cmd_tx = self.cmd_tx.clone();
        let forking = ForkingConnection::new(
            incoming,
            outgoing,
            endpoint,
            Box::new(move || {
                let _ = cmd_tx.send(Command::ForkingClosed { token });
            }),
        );
        self.forking.insert(token, Arc::clone(&forking));
        self.pending_forwarded.remove(&token);

        if endpoint {
            let events = forking
                .take_events()
                .expect("endpoint forking connection has events");
            let connection: MeshConnection = forking;
            tokio::spawn(establish::run_terminal(
                ctx,
                source,
                connection,
                PacketStream::new(events),
            ));
        }
    }

    // ── shutdown ──

    fn shutdown(&mut self) {
        info!(local = %self.local, "router stopping");
        for (_, connection) in self.pending_forwarded.drain() {
            connection.close();
        }
        for (_, forking) in self.forking.drain() {
            forking.close();
        }
        let peer_ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for peer_id in peer_ids {
            self.drop_routing_link(peer_id);
        }
    }
}
