//! Relay connection composite

use crate::error::{MeshError, Result};
use crate::network::{CloseReason, ConnectionEvent, ConnectionParts, MeshConnection, UnderlyingConnection};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Callback fired once, when the forking connection goes down, so the owner
/// can release its retention.
pub type CloseCallback = Box<dyn FnOnce() + Send>;

/// A relay between two connections that can also act as a local endpoint.
///
/// Bytes received on `incoming` are written verbatim to `outgoing`; bytes
/// received on `outgoing` are written verbatim back to `incoming`. The relay
/// carries both directions so confirmations and return traffic cross it
/// unchanged. When constructed as an endpoint, everything relayed in either
/// direction is additionally surfaced on the local event stream, and local
/// writes travel toward the source side (`incoming`).
///
/// Close on either underlying connection closes the whole composite and
/// fires the owner's close callback.
pub struct ForkingConnection {
    incoming: MeshConnection,
    outgoing: MeshConnection,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    closed: Arc<AtomicBool>,
    local_tx: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    on_close: Mutex<Option<CloseCallback>>,
}

impl std::fmt::Debug for ForkingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkingConnection").finish_non_exhaustive()
    }
}

/// Which underlying stream a pump drains
#[derive(Clone, Copy)]
enum Side {
    Incoming,
    Outgoing,
}

impl ForkingConnection {
    /// Wire `incoming` and `outgoing` together.
    ///
    /// `endpoint` controls whether the relayed stream is surfaced locally;
    /// a pure relay keeps no event channel at all, so relayed bytes are
    /// never buffered for a reader that does not exist.
    pub fn new(
        incoming: ConnectionParts,
        outgoing: ConnectionParts,
        endpoint: bool,
        on_close: CloseCallback,
    ) -> Arc<Self> {
        let closed = Arc::new(AtomicBool::new(false));
        let (local_tx, events_rx) = if endpoint {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let connection = Arc::new(Self {
            incoming: Arc::clone(&incoming.connection),
            outgoing: Arc::clone(&outgoing.connection),
            events_rx: Mutex::new(events_rx),
            closed,
            local_tx,
            on_close: Mutex::new(Some(on_close)),
        });

        connection.spawn_pump(Side::Incoming, incoming);
        connection.spawn_pump(Side::Outgoing, outgoing);
        connection
    }

    fn spawn_pump(self: &Arc<Self>, side: Side, parts: ConnectionParts) {
        let this = Arc::clone(self);
        let ConnectionParts {
            events: mut rx,
            leftover,
            ..
        } = parts;
        tokio::spawn(async move {
            if !leftover.is_empty() && this.relay(side, leftover).await.is_err() {
                this.shut_down(CloseReason::Error("relay write failed".into()));
                return;
            }
            loop {
                match rx.recv().await {
                    Some(ConnectionEvent::Data(bytes)) => {
                        if this.relay(side, bytes).await.is_err() {
                            this.shut_down(CloseReason::Error("relay write failed".into()));
                            break;
                        }
                    }
                    Some(ConnectionEvent::Closed(reason)) => {
                        this.shut_down(reason);
                        break;
                    }
                    None => {
                        this.shut_down(CloseReason::Remote);
                        break;
                    }
                }
            }
        });
    }

    /// Forward one chunk across the relay and tap it locally.
    async fn relay(&self, from: Side, bytes: Bytes) -> Result<()> {
        if let Some(tx) = &self.local_tx {
            let _ = tx.send(ConnectionEvent::Data(bytes.clone()));
        }
        match from {
            Side::Incoming => self.outgoing.write(bytes).await,
            Side::Outgoing => self.incoming.write(bytes).await,
        }
    }

    fn shut_down(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(?reason, "forking connection closing");
        self.incoming.close();
        self.outgoing.close();
        if let Some(tx) = &self.local_tx {
            let _ = tx.send(ConnectionEvent::Closed(reason));
        }
        if let Some(callback) = self.on_close.lock().take() {
            callback();
        }
    }
}

#[async_trait]
impl UnderlyingConnection for ForkingConnection {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn write(&self, bytes: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::TransportClosed);
        }
        // Local endpoint traffic travels toward the source.
        self.incoming.write(bytes).await
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events_rx.lock().take()
    }

    fn close(&self) {
        self.shut_down(CloseReason::Local);
    }
}
