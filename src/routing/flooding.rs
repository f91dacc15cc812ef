//! Flooded dissemination with per-origin sequence dedup
//!
//! Every flooded packet travels inside a `FloodingEnvelope` keyed by
//! `(origin, sequence)`. Each node records what it has seen and delivers a
//! given envelope to local handlers at most once, re-broadcasting fresh
//! envelopes to every neighbor except the one it came from. Dedup is exact,
//! not probabilistic: the seen-set keeps, per origin, the highest contiguous
//! sequence plus any out-of-order sequences above it, so memory stays
//! bounded under gap-free growth.

use crate::error::WireError;
use crate::protocol::{encode_packet, Packet};
use crate::routing::PeerId;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, trace};

/// Type-erased handler invoked with the envelope origin and the inner packet.
///
/// Handlers run on the router's dispatch context and must stay lightweight;
/// the router's own handler pushes into its command channel.
pub type FloodHandler = Box<dyn Fn(PeerId, &Packet) + Send>;

/// What `receive` decided about an incoming envelope
#[derive(Debug)]
pub enum FloodOutcome {
    /// Seen before; drop silently
    Duplicate,
    /// Fresh: handlers were dispatched, re-broadcast these bytes to every
    /// neighbor except the sender
    Fresh {
        /// The re-encoded envelope frame
        rebroadcast: Bytes,
    },
}

/// Per-origin record of delivered sequences
#[derive(Debug, Default)]
struct SeenWindow {
    /// All sequences `<= watermark` have been seen (None until seq 0 arrives)
    watermark: Option<u32>,
    /// Seen sequences above the watermark, awaiting gap fill
    above: BTreeSet<u32>,
}

impl SeenWindow {
    fn contains(&self, seq: u32) -> bool {
        match self.watermark {
            Some(w) if seq <= w => true,
            _ => self.above.contains(&seq),
        }
    }

    fn insert(&mut self, seq: u32) {
        if self.contains(seq) {
            return;
        }
        let next = match self.watermark {
            None => 0,
            Some(w) => w + 1,
        };
        if seq == next {
            let mut w = seq;
            while self.above.remove(&(w + 1)) {
                w += 1;
            }
            self.watermark = Some(w);
        } else {
            self.above.insert(seq);
        }
    }
}

/// De-duplicating flood dissemination service.
///
/// The manager owns sequencing and dedup; actually writing bytes to
/// neighbors is the router's job, so both `flood` and `receive` hand back
/// encoded envelope frames for the router to send.
pub struct FloodingManager {
    local: PeerId,
    next_sequence: u32,
    seen: HashMap<PeerId, SeenWindow>,
    handlers: HashMap<u16, Vec<FloodHandler>>,
}

impl FloodingManager {
    /// Create a manager flooding under the given local identity
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            next_sequence: 0,
            seen: HashMap::new(),
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for inner packets with the given type tag.
    ///
    /// Multiple handlers per tag are allowed; they run in registration order.
    pub fn register(&mut self, tag: u16, handler: FloodHandler) {
        self.handlers.entry(tag).or_default().push(handler);
    }

    /// Wrap a packet in an envelope under the local identity and the next
    /// sequence number, returning the frame to send to every neighbor.
    ///
    /// The envelope is recorded as seen so echoes from neighbors are dropped.
    pub fn flood(&mut self, inner: Packet) -> Result<Bytes, WireError> {
        let sequence = self.next_sequence;
        let envelope = Packet::Flood {
            origin: self.local,
            sequence,
            inner: Box::new(inner),
        };
        let frame = encode_packet(&envelope)?;
        self.next_sequence += 1;
        self.seen.entry(self.local).or_default().insert(sequence);
        trace!(seq = sequence, "flooding packet");
        Ok(frame)
    }

    /// Process an envelope received from a neighbor.
    ///
    /// Fresh envelopes are dispatched to handlers registered for the inner
    /// packet's tag and returned re-encoded for re-broadcast.
    pub fn receive(&mut self, envelope: &Packet) -> Result<FloodOutcome, WireError> {
        let (origin, sequence, inner) = match envelope {
            Packet::Flood {
                origin,
                sequence,
                inner,
            } => (*origin, *sequence, inner.as_ref()),
            other => {
                return Err(WireError::InvalidField {
                    field: "tag",
                    reason: format!("expected flooding envelope, got {:#06x}", other.tag()),
                })
            }
        };

        let window = self.seen.entry(origin).or_default();
        if window.contains(sequence) {
            trace!(%origin, seq = sequence, "duplicate envelope dropped");
            return Ok(FloodOutcome::Duplicate);
        }
        window.insert(sequence);

        debug!(%origin, seq = sequence, tag = inner.tag(), "flood delivery");
        if let Some(handlers) = self.handlers.get(&inner.tag()) {
            for handler in handlers {
                handler(origin, inner);
            }
        }

        let rebroadcast = encode_packet(envelope)?;
        Ok(FloodOutcome::Fresh { rebroadcast })
    }
}
