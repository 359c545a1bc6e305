//! Hop wire protocol: message, relay envelope, frame kinds, and control payloads.

use serde::{Deserialize, Serialize};

use crate::identity::PeerAddress;

/// Current protocol version. Used in beacons and the connection handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default maximum number of relay hops for a new envelope.
pub const DEFAULT_MAX_HOPS: u32 = 10;

/// Default envelope lifetime (5 minutes) in milliseconds.
pub const DEFAULT_TTL_MS: u64 = 5 * 60 * 1000;

/// A short text message. Immutable after creation except for `delivered`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Globally unique id assigned by the originating node; dedup key.
    pub id: String,
    pub sender: String,
    pub receiver: String,
    pub content: String,
    /// Creation time, Unix milliseconds.
    pub timestamp_ms: u64,
    /// Assigned by the originator; not rewritten in transit.
    pub hop_count: u32,
    pub delivered: bool,
}

impl Message {
    /// New message with a fresh v4 UUID id.
    pub fn new(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        content: impl Into<String>,
        now_ms: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender: sender.into(),
            receiver: receiver.into(),
            content: content.into(),
            timestamp_ms: now_ms,
            hop_count: 0,
            delivered: false,
        }
    }
}

/// A message in transit through the mesh, with the route it has travelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub message: Message,
    /// Hop identifiers visited, origin first.
    pub route: Vec<PeerAddress>,
    pub max_hops: u32,
    /// Absolute expiry, Unix milliseconds.
    pub expires_at_ms: u64,
}

impl RelayEnvelope {
    /// Envelope for a message entering the mesh with the given starting route.
    pub fn new(message: Message, route: Vec<PeerAddress>, max_hops: u32, expires_at_ms: u64) -> Self {
        Self {
            message,
            route,
            max_hops,
            expires_at_ms,
        }
    }

    /// Envelope id; always equal to the carried message id.
    pub fn envelope_id(&self) -> &str {
        &self.message.id
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at_ms
    }

    /// True when the route has used up the hop budget.
    pub fn hops_exhausted(&self) -> bool {
        self.route.len() >= self.max_hops as usize
    }

    /// Copy of this envelope with `hop` appended to the route.
    pub fn with_hop(&self, hop: PeerAddress) -> Self {
        let mut route = Vec::with_capacity(self.route.len() + 1);
        route.extend(self.route.iter().cloned());
        route.push(hop);
        Self {
            message: self.message.clone(),
            route,
            max_hops: self.max_hops,
            expires_at_ms: self.expires_at_ms,
        }
    }
}

/// Inbound stream frame kinds. The tag is written before the body (see wire module).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Bare message for direct local delivery at the receiving node.
    LocalMessage(Message),
    /// Envelope to run through the relay engine.
    Relay(RelayEnvelope),
}

/// Discovery beacon (UDP multicast): advertise presence and the stream listen port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub protocol_version: u8,
    pub address: PeerAddress,
    pub listen_port: u16,
}

/// Connection handshake, exchanged once in each direction on a new stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u8,
    pub address: PeerAddress,
}

impl Hello {
    pub fn new(address: PeerAddress) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_id_matches_message_id() {
        let m = Message::new("x", "z", "hi", 1_000);
        let env = RelayEnvelope::new(m.clone(), vec![], DEFAULT_MAX_HOPS, 2_000);
        assert_eq!(env.envelope_id(), m.id);
    }

    #[test]
    fn with_hop_leaves_original_untouched() {
        let m = Message::new("x", "z", "hi", 0);
        let env = RelayEnvelope::new(m, vec![PeerAddress::from("a")], 3, 10);
        let next = env.with_hop(PeerAddress::from("b"));
        assert_eq!(env.route.len(), 1);
        assert_eq!(next.route, vec![PeerAddress::from("a"), PeerAddress::from("b")]);
        assert_eq!(next.envelope_id(), env.envelope_id());
    }

    #[test]
    fn expiry_is_strictly_after() {
        let env = RelayEnvelope::new(Message::new("x", "z", "", 0), vec![], 1, 100);
        assert!(!env.is_expired(100));
        assert!(env.is_expired(101));
    }
}
