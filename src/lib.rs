//! # Meshwork
//!
//! Link-state mesh routing and multi-hop connection establishment for
//! ad-hoc peer-to-peer networks.
//!
//! Peers discover each other over arbitrary transport substrates and stay
//! mutually reachable even without a direct link: every router floods its
//! neighbor list mesh-wide, computes shortest paths over the resulting
//! graph, and establishes end-to-end connections across relays, including
//! one-to-many trees where a single peer relays and receives at once.
//!
//! ## Quick Start
//!
//! ```no_run
//! use meshwork::{MeshConnection, PeerId, Router, RouterDelegate, UnderlyingConnection};
//! use std::sync::Arc;
//!
//! struct App;
//!
//! impl RouterDelegate for App {
//!     fn did_find_peer(&self, peer: PeerId, route: meshwork::Route) {
//!         println!("found {} at cost {}", peer, route.cost);
//!     }
//!     fn handle_connection(&self, source: PeerId, _connection: MeshConnection) {
//!         println!("inbound stream from {}", source);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> meshwork::Result<()> {
//!     let router = Router::builder().delegate(Arc::new(App)).build();
//!     // Wire transports via router.transport_events(), then:
//!     let peer = PeerId::random();
//!     let connection = router.establish_connection(peer).await?;
//!     connection.write(bytes::Bytes::from_static(b"hello")).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod routing;

// Re-export main types
pub use config::RouterConfig;
pub use error::{MeshError, Result, WireError};
pub use network::{
    Address, CloseReason, ConnectionEvent, ConnectionParts, ForkingConnection, MeshConnection,
    MulticastConnection, PacketStream, Transport, UnderlyingConnection,
};
pub use routing::{
    FloodingManager, HopTree, LinkStateTable, PeerId, RepeatedExecutor, Route, Router,
    RouterBuilder, RouterDelegate, RoutingTableChange, TransferId, TransportEvents,
};
