//! Connection-establishment flows
//!
//! Each flow runs as its own task, awaiting packet I/O step by step; every
//! state mutation it needs goes back through the router's command channel,
//! so the router core stays the single place that touches shared state.

use crate::error::{MeshError, Result};
use crate::network::{
    ConnectionParts, MeshConnection, MulticastConnection, PacketStream, UnderlyingConnection,
};
use crate::network::Address;
use crate::protocol::{encode_packet, LinkPurpose, Packet};
use crate::routing::router::Command;
use crate::routing::{HopTree, PeerId};
use bytes::Bytes;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

/// Everything an establishment task needs from the router
#[derive(Clone)]
pub(crate) struct EstablishContext {
    pub local: PeerId,
    pub step_timeout: Duration,
    pub cmd_tx: mpsc::UnboundedSender<Command>,
}

impl EstablishContext {
    fn send(&self, command: Command) {
        let _ = self.cmd_tx.send(command);
    }
}

async fn timed<T>(deadline: Duration, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(MeshError::Timeout),
    }
}

// ───────────────────────── outbound: one branch ─────────────────────────

/// Open one hop connection: connect, announce ourselves for a routed link,
/// and hand over the next-hop subtree.
async fn open_branch(
    ctx: EstablishContext,
    source: PeerId,
    destinations: Vec<PeerId>,
    subtree: HopTree,
    address: Arc<dyn Address>,
) -> Result<ConnectionParts> {
    let connection = address.open();
    let result = async {
        timed(ctx.step_timeout, connection.connect()).await?;
        let events = connection
            .take_events()
            .ok_or(MeshError::TransportClosed)?;
        let handshake = encode_packet(&Packet::LinkHandshake {
            peer: ctx.local,
            purpose: LinkPurpose::Routed,
        })?;
        timed(ctx.step_timeout, connection.write(handshake)).await?;
        let plan = encode_packet(&Packet::MulticastHandshake {
            source,
            destinations,
            route: subtree,
        })?;
        timed(ctx.step_timeout, connection.write(plan)).await?;
        Ok(ConnectionParts {
            connection: Arc::clone(&connection),
            events,
            leftover: Bytes::new(),
        })
    }
    .await;
    if result.is_err() {
        connection.close();
    }
    result
}

// ───────────────────────── initiator ─────────────────────────

/// Establish a multicast connection to every destination and confirm it end
/// to end, replying to the caller when done.
///
/// All-or-nothing: any branch failure closes everything already opened.
pub(crate) async fn run_multicast(
    ctx: EstablishContext,
    destinations: BTreeSet<PeerId>,
    branches: Vec<(HopTree, Arc<dyn Address>)>,
    reply: oneshot::Sender<Result<MeshConnection>>,
) {
    let total = branches.len();
    let dest_list: Vec<PeerId> = destinations.iter().copied().collect();

    // Open every branch and send the handshakes.
    let opened = join_all(branches.into_iter().map(|(subtree, address)| {
        let ctx = ctx.clone();
        let dest_list = dest_list.clone();
        let expected: BTreeSet<PeerId> = subtree
            .peers()
            .into_iter()
            .filter(|p| destinations.contains(p))
            .collect();
        async move {
            open_branch(ctx.clone(), ctx.local, dest_list, subtree, address)
                .await
                .map(|parts| (parts, expected))
        }
    }))
    .await;

    let mut up = Vec::new();
    let mut any_failed = false;
    for result in opened {
        match result {
            Ok(branch) => up.push(branch),
            Err(error) => {
                warn!(%error, "multicast branch failed to open");
                any_failed = true;
            }
        }
    }
    if any_failed {
        let established = up.len();
        for (parts, _) in up {
            parts.connection.close();
        }
        let _ = reply.send(Err(MeshError::PartialMulticast { established, total }));
        return;
    }

    // Await one confirmation per destination, each on the branch whose
    // subtree contains it.
    let confirmed = join_all(
        up.into_iter()
            .map(|(parts, expected)| collect_confirmations(ctx.clone(), parts, expected)),
    )
    .await;

    let mut branches = Vec::new();
    let mut failures = 0usize;
    for result in confirmed {
        match result {
            Ok(parts) => branches.push(parts),
            Err(error) => {
                warn!(%error, "multicast branch failed to confirm");
                failures += 1;
            }
        }
    }
    if failures > 0 {
        for parts in branches {
            parts.connection.close();
        }
        let _ = reply.send(Err(MeshError::PartialMulticast {
            established: total - failures,
            total,
        }));
        return;
    }

    // Everyone is wired; release the endpoints with our own confirmation.
    match encode_packet(&Packet::Established { source: ctx.local }) {
        Ok(frame) => {
            for parts in &branches {
                if timed(ctx.step_timeout, parts.connection.write(frame.clone()))
                    .await
                    .is_err()
                {
                    for parts in &branches {
                        parts.connection.close();
                    }
                    let _ = reply.send(Err(MeshError::TransportClosed));
                    return;
                }
            }
        }
        Err(error) => {
            for parts in &branches {
                parts.connection.close();
            }
            let _ = reply.send(Err(error.into()));
            return;
        }
    }

    debug!(destinations = dest_list.len(), "multicast established");
    let composite: MeshConnection = MulticastConnection::new(branches);
    let _ = reply.send(Ok(composite));
}

/// Read confirmations off one branch until every expected destination has
/// reported in.
async fn collect_confirmations(
    ctx: EstablishContext,
    parts: ConnectionParts,
    mut expected: BTreeSet<PeerId>,
) -> Result<ConnectionParts> {
    let ConnectionParts {
        connection,
        events,
        leftover,
    } = parts;
    let mut stream = PacketStream::resume(events, leftover);
    let deadline = Instant::now() + ctx.step_timeout;

    while !expected.is_empty() {
        let packet = match tokio::time::timeout_at(deadline, stream.next_packet()).await {
            Ok(Ok(packet)) => packet,
            Ok(Err(error)) => {
                connection.close();
                return Err(error);
            }
            Err(_) => {
                connection.close();
                return Err(MeshError::Timeout);
            }
        };
        match packet {
            Packet::Established { source } => {
                if !expected.remove(&source) {
                    connection.close();
                    return Err(MeshError::Handshake(format!(
                        "confirmation from unexpected peer {:?}",
                        source
                    )));
                }
                debug!(%source, "destination confirmed");
            }
            other => {
                connection.close();
                return Err(MeshError::Handshake(format!(
                    "unexpected packet {:#06x} while awaiting confirmations",
                    other.tag()
                )));
            }
        }
    }
    Ok(stream.into_parts(connection))
}

// ───────────────────────── responder ─────────────────────────

/// Handle a raw inbound connection: read the link handshake and dispatch on
/// its purpose. Unknown or malformed openings close the connection.
pub(crate) async fn handle_inbound(ctx: EstablishContext, connection: MeshConnection) {
    let Some(events) = connection.take_events() else {
        connection.close();
        return;
    };
    let mut stream = PacketStream::new(events);
    let first = match timed(ctx.step_timeout, stream.next_packet()).await {
        Ok(packet) => packet,
        Err(error) => {
            debug!(%error, "inbound connection died before handshake");
            connection.close();
            return;
        }
    };
    match first {
        Packet::LinkHandshake {
            peer,
            purpose: LinkPurpose::Routing,
        } => {
            ctx.send(Command::RoutingInbound {
                peer,
                parts: stream.into_parts(connection),
            });
        }
        Packet::LinkHandshake {
            peer,
            purpose: LinkPurpose::Routed,
        } => {
            handle_hop(ctx, peer, connection, stream).await;
        }
        other => {
            warn!(tag = other.tag(), "unexpected opening packet");
            connection.close();
        }
    }
}

/// One edge of a routed path: read the plan and either terminate here or
/// start forwarding.
async fn handle_hop(
    ctx: EstablishContext,
    from: PeerId,
    connection: MeshConnection,
    mut stream: PacketStream,
) {
    let plan = match timed(ctx.step_timeout, stream.next_packet()).await {
        Ok(Packet::MulticastHandshake {
            source,
            destinations,
            route,
        }) => (source, destinations, route),
        Ok(other) => {
            warn!(%from, tag = other.tag(), "expected multicast handshake");
            connection.close();
            return;
        }
        Err(error) => {
            debug!(%from, %error, "hop connection died before plan");
            connection.close();
            return;
        }
    };
    let (source, destinations, route) = plan;
    if route.id != ctx.local {
        warn!(%source, "plan rooted at a different peer");
        connection.close();
        return;
    }
    if route.is_leaf() {
        run_terminal(ctx, source, connection, stream).await;
    } else {
        ctx.send(Command::StartForwarding {
            source,
            destinations,
            route,
            incoming: stream.into_parts(connection),
        });
    }
}

/// Terminal side of the two-phase confirmation: confirm our end, wait for
/// the initiator's confirmation, then hand the stream to the upper layer.
pub(crate) async fn run_terminal(
    ctx: EstablishContext,
    source: PeerId,
    connection: MeshConnection,
    mut stream: PacketStream,
) {
    let confirm = match encode_packet(&Packet::Established { source: ctx.local }) {
        Ok(frame) => frame,
        Err(_) => {
            connection.close();
            return;
        }
    };
    if timed(ctx.step_timeout, connection.write(confirm))
        .await
        .is_err()
    {
        connection.close();
        return;
    }

    let deadline = Instant::now() + ctx.step_timeout;
    loop {
        match tokio::time::timeout_at(deadline, stream.next_packet()).await {
            Ok(Ok(Packet::Established { source: s })) if s == source => break,
            // A sibling destination's confirmation surfacing through the
            // relay tap; not ours to act on.
            Ok(Ok(Packet::Established { .. })) => continue,
            Ok(Ok(other)) => {
                warn!(%source, tag = other.tag(), "expected initiator confirmation");
                connection.close();
                return;
            }
            Ok(Err(error)) => {
                debug!(%source, %error, "connection died awaiting confirmation");
                connection.close();
                return;
            }
            Err(_) => {
                debug!(%source, "timed out awaiting initiator confirmation");
                connection.close();
                return;
            }
        }
    }

    let parts = stream.into_parts(connection);
    let endpoint: MeshConnection = MulticastConnection::new(vec![parts]);
    ctx.send(Command::TerminalReady {
        source,
        connection: endpoint,
    });
}

// ───────────────────────── relay ─────────────────────────

/// Open every child branch of a forwarding plan and hand the completed set
/// back to the router core, or tear everything down on any failure.
pub(crate) async fn run_forward(
    ctx: EstablishContext,
    token: crate::routing::TransferId,
    source: PeerId,
    destinations: Vec<PeerId>,
    children: Vec<(HopTree, Arc<dyn Address>)>,
    incoming: ConnectionParts,
) {
    let opened = join_all(children.into_iter().map(|(subtree, address)| {
        open_branch(
            ctx.clone(),
            source,
            destinations.clone(),
            subtree,
            address,
        )
    }))
    .await;

    let mut branches = Vec::new();
    let mut any_failed = false;
    for result in opened {
        match result {
            Ok(parts) => branches.push(parts),
            Err(error) => {
                warn!(%source, %error, "forwarding branch failed");
                any_failed = true;
            }
        }
    }
    if any_failed {
        for parts in branches {
            parts.connection.close();
        }
        incoming.connection.close();
        ctx.send(Command::ForwardFailed { token });
        return;
    }

    let outgoing = if branches.len() == 1 {
        branches.pop().expect("one branch")
    } else {
        let composite = MulticastConnection::new(branches);
        let events = composite
            .take_events()
            .expect("fresh composite events");
        ConnectionParts {
            connection: composite,
            events,
            leftover: Bytes::new(),
        }
    };

    ctx.send(Command::ForwardReady {
        token,
        source,
        destinations,
        incoming,
        outgoing,
    });
}

// ───────────────────────── routing link ─────────────────────────

/// One attempt to bring up the long-lived routing link to a neighbor.
pub(crate) async fn attempt_routing_link(
    ctx: EstablishContext,
    peer: PeerId,
    address: Arc<dyn Address>,
    generation: u64,
) {
    let connection = address.open();
    let result: Result<ConnectionParts> = async {
        timed(ctx.step_timeout, connection.connect()).await?;
        let events = connection
            .take_events()
            .ok_or(MeshError::TransportClosed)?;
        let handshake = encode_packet(&Packet::LinkHandshake {
            peer: ctx.local,
            purpose: LinkPurpose::Routing,
        })?;
        timed(ctx.step_timeout, connection.write(handshake)).await?;
        Ok(ConnectionParts {
            connection: Arc::clone(&connection),
            events,
            leftover: Bytes::new(),
        })
    }
    .await;

    match result {
        Ok(parts) => {
            ctx.send(Command::RoutingOutboundUp {
                peer,
                generation,
                parts,
            });
        }
        Err(error) => {
            debug!(%peer, %error, "routing link attempt failed");
            connection.close();
            ctx.send(Command::RoutingOutboundFailed { peer, generation });
        }
    }
}

/// Long-lived read loop on an established routing link; every flooding
/// envelope goes to the core, anything else is noise.
pub(crate) async fn routing_reader(
    ctx: EstablishContext,
    peer: PeerId,
    generation: u64,
    mut stream: PacketStream,
) {
    loop {
        match stream.next_packet().await {
            Ok(envelope @ Packet::Flood { .. }) => {
                ctx.send(Command::FloodReceived {
                    from: peer,
                    envelope,
                });
            }
            Ok(other) => {
                warn!(%peer, tag = other.tag(), "non-flood packet on routing link");
            }
            Err(_) => {
                ctx.send(Command::RoutingLinkClosed { peer, generation });
                return;
            }
        }
    }
}
