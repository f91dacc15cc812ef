//! Frame codec for control packets
//!
//! Layouts (all integers big-endian):
//!
//! ```text
//! frame              = u16 length ‖ body            (length excludes itself)
//! body               = u16 tag ‖ payload
//! LinkHandshake      = PeerId(16) ‖ u8 purpose
//! MulticastHandshake = PeerId(16) ‖ u16 n ‖ PeerId×n ‖ tree
//! tree               = PeerId(16) ‖ u16 children ‖ tree×children
//! Established        = PeerId(16)
//! LinkState          = PeerId(16) ‖ u16 n ‖ (PeerId(16) ‖ i32 cost)×n
//! Flood              = PeerId(16) ‖ u32 sequence ‖ body
//! ```

use crate::error::WireError;
use crate::protocol::{
    LinkPurpose, Packet, TAG_ESTABLISHED, TAG_FLOOD, TAG_LINK_HANDSHAKE, TAG_LINK_STATE,
    TAG_MULTICAST_HANDSHAKE,
};
use crate::routing::{HopTree, PeerId};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Largest body that fits behind a 16-bit length prefix
const MAX_FRAME_BODY: usize = u16::MAX as usize;

/// Deepest hop tree the decoder will follow; real paths are orders of
/// magnitude shallower
const MAX_TREE_DEPTH: usize = 64;

/// Encode a packet as a complete frame, length prefix included.
pub fn encode_packet(packet: &Packet) -> Result<Bytes, WireError> {
    let mut body = BytesMut::with_capacity(64);
    encode_body(packet, &mut body)?;
    if body.len() > MAX_FRAME_BODY {
        return Err(WireError::Oversized(body.len()));
    }
    let mut frame = BytesMut::with_capacity(2 + body.len());
    frame.put_u16(body.len() as u16);
    frame.extend_from_slice(&body);
    Ok(frame.freeze())
}

/// Decode one frame body (tag + payload, no length prefix).
pub fn decode_packet(body: &[u8]) -> Result<Packet, WireError> {
    let mut buf = body;
    let packet = decode_body(&mut buf, true)?;
    if buf.has_remaining() {
        return Err(WireError::InvalidField {
            field: "frame",
            reason: format!("{} trailing bytes", buf.remaining()),
        });
    }
    Ok(packet)
}

fn encode_body(packet: &Packet, out: &mut BytesMut) -> Result<(), WireError> {
    out.put_u16(packet.tag());
    match packet {
        Packet::LinkHandshake { peer, purpose } => {
            put_peer(out, peer);
            out.put_u8(*purpose as u8);
        }
        Packet::MulticastHandshake {
            source,
            destinations,
            route,
        } => {
            put_peer(out, source);
            put_count(out, destinations.len(), "destination_count")?;
            for dest in destinations {
                put_peer(out, dest);
            }
            encode_tree(route, out)?;
        }
        Packet::Established { source } => {
            put_peer(out, source);
        }
        Packet::LinkState { origin, neighbors } => {
            put_peer(out, origin);
            put_count(out, neighbors.len(), "neighbor_count")?;
            for (peer, cost) in neighbors {
                put_peer(out, peer);
                let cost = i32::try_from(*cost).map_err(|_| WireError::InvalidField {
                    field: "cost",
                    reason: format!("cost {} exceeds i32", cost),
                })?;
                out.put_i32(cost);
            }
        }
        Packet::Flood {
            origin,
            sequence,
            inner,
        } => {
            if matches!(**inner, Packet::Flood { .. }) {
                return Err(WireError::InvalidField {
                    field: "inner",
                    reason: "flooding envelopes do not nest".into(),
                });
            }
            put_peer(out, origin);
            out.put_u32(*sequence);
            encode_body(inner, out)?;
        }
    }
    Ok(())
}

fn decode_body(buf: &mut &[u8], allow_flood: bool) -> Result<Packet, WireError> {
    let tag = get_u16(buf)?;
    match tag {
        TAG_LINK_HANDSHAKE => {
            let peer = get_peer(buf)?;
            let purpose = LinkPurpose::try_from(get_u8(buf)?)?;
            Ok(Packet::LinkHandshake { peer, purpose })
        }
        TAG_MULTICAST_HANDSHAKE => {
            let source = get_peer(buf)?;
            let count = get_count(buf, 16)?;
            let mut destinations = Vec::with_capacity(count);
            for _ in 0..count {
                destinations.push(get_peer(buf)?);
            }
            let route = decode_tree(buf, 0)?;
            Ok(Packet::MulticastHandshake {
                source,
                destinations,
                route,
            })
        }
        TAG_ESTABLISHED => {
            let source = get_peer(buf)?;
            Ok(Packet::Established { source })
        }
        TAG_LINK_STATE => {
            let origin = get_peer(buf)?;
            let count = get_count(buf, 20)?;
            let mut neighbors = Vec::with_capacity(count);
            for _ in 0..count {
                let peer = get_peer(buf)?;
                let cost = get_i32(buf)?;
                let cost = u32::try_from(cost).map_err(|_| WireError::InvalidField {
                    field: "cost",
                    reason: format!("negative cost {}", cost),
                })?;
                neighbors.push((peer, cost));
            }
            Ok(Packet::LinkState { origin, neighbors })
        }
        TAG_FLOOD if allow_flood => {
            let origin = get_peer(buf)?;
            let sequence = get_u32(buf)?;
            let inner = decode_body(buf, false)?;
            Ok(Packet::Flood {
                origin,
                sequence,
                inner: Box::new(inner),
            })
        }
        other => Err(WireError::UnknownTag(other)),
    }
}

fn encode_tree(tree: &HopTree, out: &mut BytesMut) -> Result<(), WireError> {
    put_peer(out, &tree.id);
    put_count(out, tree.children.len(), "child_count")?;
    for child in &tree.children {
        encode_tree(child, out)?;
    }
    Ok(())
}

fn decode_tree(buf: &mut &[u8], depth: usize) -> Result<HopTree, WireError> {
    if depth > MAX_TREE_DEPTH {
        return Err(WireError::InvalidField {
            field: "tree",
            reason: format!("nesting exceeds {} levels", MAX_TREE_DEPTH),
        });
    }
    let id = get_peer(buf)?;
    let count = get_count(buf, 18)?;
    let mut children = Vec::with_capacity(count);
    for _ in 0..count {
        children.push(decode_tree(buf, depth + 1)?);
    }
    Ok(HopTree { id, children })
}

fn put_peer(out: &mut BytesMut, peer: &PeerId) {
    out.put_slice(peer.as_bytes());
}

fn put_count(out: &mut BytesMut, count: usize, field: &'static str) -> Result<(), WireError> {
    let count = u16::try_from(count).map_err(|_| WireError::InvalidField {
        field,
        reason: format!("count {} exceeds u16", count),
    })?;
    out.put_u16(count);
    Ok(())
}

/// Read a u16 element count, rejecting counts that cannot possibly fit in
/// the remaining bytes (each element is at least `min_element_size` bytes).
fn get_count(buf: &mut &[u8], min_element_size: usize) -> Result<usize, WireError> {
    let count = get_u16(buf)? as usize;
    let needed = count.saturating_mul(min_element_size);
    if buf.remaining() < needed {
        return Err(WireError::Truncated {
            needed: needed - buf.remaining(),
        });
    }
    Ok(count)
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, WireError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8]) -> Result<u16, WireError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_i32(buf: &mut &[u8]) -> Result<i32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

fn get_peer(buf: &mut &[u8]) -> Result<PeerId, WireError> {
    ensure(buf, 16)?;
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    Ok(PeerId::from_bytes(raw))
}

fn ensure(buf: &&[u8], len: usize) -> Result<(), WireError> {
    if buf.remaining() < len {
        Err(WireError::Truncated {
            needed: len - buf.remaining(),
        })
    } else {
        Ok(())
    }
}

/// Reassembles length-prefixed frames from an arbitrary byte stream.
///
/// Transports deliver whatever chunk sizes they like; push each chunk in and
/// drain complete frame bodies out.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the transport
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame body, if one has fully arrived
    pub fn next_frame(&mut self) -> Option<Bytes> {
        if self.buf.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < 2 + len {
            return None;
        }
        self.buf.advance(2);
        Some(self.buf.split_to(len).freeze())
    }

    /// Bytes buffered but not yet consumed as frames
    ///
    /// Used when a stream switches from framed control packets to raw
    /// application data: whatever sits here belongs to the application.
    pub fn into_remainder(self) -> Bytes {
        self.buf.freeze()
    }

    /// Whether any unconsumed bytes are buffered
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
