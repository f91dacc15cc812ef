//! Fan-out connection composite

use crate::error::{MeshError, Result};
use crate::network::{CloseReason, ConnectionEvent, ConnectionParts, MeshConnection, UnderlyingConnection};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// One writable stream fanning out to N subconnections.
///
/// `write` resolves when every subconnection has accepted the bytes; any
/// subconnection failure fails the write. Closing the composite closes all
/// subconnections, and the first subconnection to close takes the composite
/// down with it.
///
/// Inbound data from subconnections is surfaced on the composite's event
/// stream in arrival order. With a single subconnection that is simply the
/// relayed stream; with several, chunks from different branches interleave
/// at write granularity.
pub struct MulticastConnection {
    subconnections: Arc<Vec<MeshConnection>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for MulticastConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MulticastConnection").finish_non_exhaustive()
    }
}

impl MulticastConnection {
    /// Aggregate already-established subconnections.
    ///
    /// Each branch's leftover bytes are surfaced before its live events, so
    /// nothing read during establishment is lost.
    pub fn new(branches: Vec<ConnectionParts>) -> Arc<Self> {
        let subconnections: Arc<Vec<MeshConnection>> = Arc::new(
            branches
                .iter()
                .map(|b| Arc::clone(&b.connection))
                .collect(),
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        for branch in branches {
            let events_tx = events_tx.clone();
            let closed = Arc::clone(&closed);
            let all = Arc::clone(&subconnections);
            let ConnectionParts {
                events: mut rx,
                leftover,
                ..
            } = branch;
            tokio::spawn(async move {
                if !leftover.is_empty() {
                    let _ = events_tx.send(ConnectionEvent::Data(leftover));
                }
                loop {
                    match rx.recv().await {
                        Some(ConnectionEvent::Data(bytes)) => {
                            let _ = events_tx.send(ConnectionEvent::Data(bytes));
                        }
                        Some(ConnectionEvent::Closed(reason)) => {
                            shut_down(&closed, &all, &events_tx, reason);
                            break;
                        }
                        None => {
                            shut_down(&closed, &all, &events_tx, CloseReason::Remote);
                            break;
                        }
                    }
                }
            });
        }

        Arc::new(Self {
            subconnections,
            events_rx: Mutex::new(Some(events_rx)),
            closed,
        })
    }

    /// Number of subconnections in the fan-out
    pub fn width(&self) -> usize {
        self.subconnections.len()
    }
}

fn shut_down(
    closed: &AtomicBool,
    subconnections: &[MeshConnection],
    events_tx: &mpsc::UnboundedSender<ConnectionEvent>,
    reason: CloseReason,
) {
    if closed.swap(true, Ordering::SeqCst) {
        return;
    }
    debug!(?reason, "multicast composite closing");
    for sub in subconnections {
        sub.close();
    }
    let _ = events_tx.send(ConnectionEvent::Closed(reason));
}

#[async_trait]
impl UnderlyingConnection for MulticastConnection {
    async fn connect(&self) -> Result<()> {
        // Subconnections are connected before aggregation.
        Ok(())
    }

    async fn write(&self, bytes: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::TransportClosed);
        }
        let writes = self
            .subconnections
            .iter()
            .map(|sub| sub.write(bytes.clone()));
        for result in join_all(writes).await {
            result?;
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events_rx.lock().take()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for sub in self.subconnections.iter() {
            sub.close();
        }
    }
}
