//! Transport-facing abstractions and connection composites
//!
//! Transports hand the router anonymous point-to-point byte streams; this
//! module defines the traits they implement ([`UnderlyingConnection`],
//! [`Address`], [`Transport`]) and the composite connection objects the
//! router builds on top of them ([`MulticastConnection`],
//! [`ForkingConnection`]).

mod forking;
pub mod memory;
mod multicast;

pub use forking::ForkingConnection;
pub use multicast::MulticastConnection;

use crate::error::{MeshError, Result};
use crate::protocol::{decode_packet, FrameBuffer, Packet};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Why a connection's event stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// This side closed the connection
    Local,
    /// The remote side closed the connection
    Remote,
    /// The transport failed
    Error(String),
}

/// Asynchronous notifications from a connection.
///
/// The event channel is the crate's rendition of `on_data`/`on_close`
/// callbacks: data chunks arrive in write order, and the stream ends with a
/// single `Closed`.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Bytes received from the remote side
    Data(Bytes),
    /// The connection is finished; no further events follow
    Closed(CloseReason),
}

/// A bidirectional byte stream to one remote endpoint.
///
/// Implemented by transports and by the composites in this module, so a
/// multi-hop connection presents the same surface as a raw socket. The event
/// receiver can be taken exactly once; whoever takes it owns inbound data.
#[async_trait]
pub trait UnderlyingConnection: Send + Sync + std::fmt::Debug {
    /// Bring the connection up. Must be called once, before the first write.
    async fn connect(&self) -> Result<()>;

    /// Send bytes to the remote side, resolving when the transport accepts
    /// the whole chunk.
    async fn write(&self, bytes: Bytes) -> Result<()>;

    /// Take the event receiver. Returns `None` if already taken or if this
    /// connection does not surface events (a pure relay).
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>>;

    /// Close the connection. Idempotent.
    fn close(&self);
}

/// A connection object as handed to callers and delegates.
pub type MeshConnection = Arc<dyn UnderlyingConnection>;

/// An opaque transport endpoint descriptor for one peer.
///
/// Carries a cost metric and acts as a factory for fresh connections to the
/// endpoint. Implementations are immutable.
pub trait Address: Send + Sync {
    /// Relative cost of this endpoint; lower is better
    fn cost(&self) -> u32;

    /// Stable identity used to deduplicate addresses and break cost ties
    fn key(&self) -> u64;

    /// Produce a fresh, unconnected connection to this endpoint
    fn open(&self) -> MeshConnection;
}

/// A transport substrate: discovers peer addresses and accepts inbound
/// connections, reporting both through the router's `TransportEvents` sink.
pub trait Transport: Send + Sync {
    /// Begin advertising and discovery, emitting events into the router
    fn start(&self, events: crate::routing::TransportEvents);

    /// Stop advertising and discovery
    fn stop(&self);
}

/// A connection together with its (already taken) event receiver and any
/// bytes read past the end of the handshake.
///
/// Establishment consumes a connection's events to read control packets;
/// whatever context the connection moves to next needs the receiver and the
/// unconsumed remainder to continue the stream without loss.
pub struct ConnectionParts {
    /// The connection itself
    pub connection: MeshConnection,
    /// Its event receiver
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
    /// Bytes received beyond the last control packet
    pub leftover: Bytes,
}

impl ConnectionParts {
    /// Take a connection's events and pair them with an empty remainder.
    ///
    /// Fails with `TransportClosed` if the events were already taken.
    pub fn take(connection: MeshConnection) -> Result<Self> {
        let events = connection.take_events().ok_or(MeshError::TransportClosed)?;
        Ok(Self {
            connection,
            events,
            leftover: Bytes::new(),
        })
    }
}

impl std::fmt::Debug for ConnectionParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParts")
            .field("leftover", &self.leftover.len())
            .finish()
    }
}

/// Reads length-prefixed control packets off a connection's event stream.
pub struct PacketStream {
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    frames: FrameBuffer,
}

impl PacketStream {
    /// Wrap an event receiver
    pub fn new(events: mpsc::UnboundedReceiver<ConnectionEvent>) -> Self {
        Self {
            events,
            frames: FrameBuffer::new(),
        }
    }

    /// Wrap an event receiver, replaying bytes already read off the stream
    pub fn resume(events: mpsc::UnboundedReceiver<ConnectionEvent>, leftover: Bytes) -> Self {
        let mut frames = FrameBuffer::new();
        frames.push(&leftover);
        Self { events, frames }
    }

    /// Await the next complete control packet.
    ///
    /// A close (or a dropped sender) surfaces as `TransportClosed`; a frame
    /// that fails to decode surfaces as a wire error.
    pub async fn next_packet(&mut self) -> Result<Packet> {
        loop {
            if let Some(frame) = self.frames.next_frame() {
                return decode_packet(&frame).map_err(MeshError::from);
            }
            match self.events.recv().await {
                Some(ConnectionEvent::Data(bytes)) => self.frames.push(&bytes),
                Some(ConnectionEvent::Closed(_)) | None => return Err(MeshError::TransportClosed),
            }
        }
    }

    /// Dismantle into the receiver plus any bytes read past the last packet
    pub fn into_parts(self, connection: MeshConnection) -> ConnectionParts {
        ConnectionParts {
            connection,
            events: self.events,
            leftover: self.frames.into_remainder(),
        }
    }
}
