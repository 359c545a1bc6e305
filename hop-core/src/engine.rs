//! Host-driven relay engine: host passes envelopes and peer events, engine returns actions.

use crate::cache::DedupCache;
use crate::identity::PeerAddress;
use crate::protocol::{Frame, Message, RelayEnvelope, DEFAULT_MAX_HOPS, DEFAULT_TTL_MS};
use crate::store::MessageStore;
use crate::wire::{self, FrameEncodeError};

/// Relay policy knobs.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Hop budget stamped on locally originated and directory-injected envelopes.
    pub max_hops: u32,
    /// Lifetime of a new envelope in milliseconds.
    pub ttl_ms: u64,
    /// Skip the link an envelope arrived on when flooding it onward.
    pub split_horizon: bool,
    /// Record locally originated messages in the store so the sender sees them.
    pub record_outbound: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_hops: DEFAULT_MAX_HOPS,
            ttl_ms: DEFAULT_TTL_MS,
            split_horizon: false,
            record_outbound: true,
        }
    }
}

/// What the host should do with an envelope after `ingest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Addressed to this node; already written to the store. `hops` is the route length on arrival.
    Deliver { message: Message, hops: usize },
    /// Write `envelope` to each of `to_peers`.
    Forward {
        to_peers: Vec<PeerAddress>,
        envelope: RelayEnvelope,
    },
    DropDuplicate,
    DropExpired,
    DropHopLimit,
}

impl Action {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Action::Deliver { .. } => "deliver",
            Action::Forward { .. } => "forward",
            Action::DropDuplicate => "drop-duplicate",
            Action::DropExpired => "drop-expired",
            Action::DropHopLimit => "drop-hop-limit",
        }
    }
}

/// Main relay state. Owns the dedup cache, the message store, and the set of open peers.
pub struct RelayEngine {
    local_address: PeerAddress,
    username: String,
    config: RelayConfig,
    cache: DedupCache,
    store: MessageStore,
    peers: Vec<PeerAddress>,
}

impl RelayEngine {
    pub fn new(local_address: PeerAddress, username: impl Into<String>) -> Self {
        Self::with_config(local_address, username, RelayConfig::default())
    }

    pub fn with_config(
        local_address: PeerAddress,
        username: impl Into<String>,
        config: RelayConfig,
    ) -> Self {
        Self {
            local_address,
            username: username.into(),
            config,
            cache: DedupCache::new(),
            store: MessageStore::new(),
            peers: Vec::new(),
        }
    }

    pub fn local_address(&self) -> &PeerAddress {
        &self.local_address
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Run an envelope received from `from` (None for the directory path) through the relay rules.
    ///
    /// Order: duplicate check, unconditional insert, expiry, local delivery, hop limit, flood.
    /// Insert happens before the drop checks so a stale duplicate is suppressed too.
    pub fn ingest(
        &mut self,
        envelope: RelayEnvelope,
        from: Option<&PeerAddress>,
        now_ms: u64,
    ) -> Action {
        if self.cache.contains(envelope.envelope_id()) {
            return Action::DropDuplicate;
        }
        self.cache.insert_if_absent(envelope.clone());

        if envelope.is_expired(now_ms) {
            return Action::DropExpired;
        }
        if envelope.message.receiver == self.username {
            let hops = envelope.route.len();
            let message = envelope.message;
            // The cache entry may have been swept while the store still holds the id.
            if !self.store.append(message.clone()) {
                return Action::DropDuplicate;
            }
            return Action::Deliver { message, hops };
        }
        if envelope.hops_exhausted() {
            return Action::DropHopLimit;
        }
        let next = envelope.with_hop(self.local_address.clone());
        Action::Forward {
            to_peers: self.forward_targets(from),
            envelope: next,
        }
    }

    /// Originate a message: wrap, cache, and flood to every open peer.
    /// The envelope stays cached with no open peers so the gateway can upload it later.
    pub fn send(&mut self, message: Message, now_ms: u64) -> Action {
        let envelope = RelayEnvelope::new(
            message,
            vec![self.local_address.clone()],
            self.config.max_hops,
            now_ms.saturating_add(self.config.ttl_ms),
        );
        if !self.cache.insert_if_absent(envelope.clone()) {
            return Action::DropDuplicate;
        }
        if self.config.record_outbound {
            self.store.append(envelope.message.clone());
        }
        Action::Forward {
            to_peers: self.peers.clone(),
            envelope,
        }
    }

    /// Handle any inbound stream frame. A bare message goes straight to the store.
    pub fn handle_frame(&mut self, frame: Frame, from: Option<&PeerAddress>, now_ms: u64) -> Action {
        match frame {
            Frame::Relay(envelope) => self.ingest(envelope, from, now_ms),
            Frame::LocalMessage(message) => {
                if self.on_local_message(message.clone()) {
                    Action::Deliver { message, hops: 0 }
                } else {
                    Action::DropDuplicate
                }
            }
        }
    }

    /// Bare local-delivery frame: append to the store, never cache or forward.
    pub fn on_local_message(&mut self, message: Message) -> bool {
        self.store.append(message)
    }

    /// Directory pull path: wrap in a fresh envelope with an empty route and ingest.
    /// Returns None if the id was already seen.
    pub fn inject_from_directory(&mut self, message: Message, now_ms: u64) -> Option<Action> {
        if self.cache.contains(&message.id) {
            return None;
        }
        let envelope = RelayEnvelope::new(
            message,
            Vec::new(),
            self.config.max_hops,
            now_ms.saturating_add(self.config.ttl_ms),
        );
        Some(self.ingest(envelope, None, now_ms))
    }

    /// Peer connection opened. Subsequent floods include it.
    pub fn on_peer_opened(&mut self, peer: PeerAddress) {
        if !self.peers.contains(&peer) {
            self.peers.push(peer);
        }
    }

    /// Peer connection closed or torn down.
    pub fn on_peer_closed(&mut self, peer: &PeerAddress) {
        self.peers.retain(|p| p != peer);
    }

    pub fn open_peers(&self) -> &[PeerAddress] {
        &self.peers
    }

    /// Periodic TTL sweep of the dedup cache. Returns the number of evicted entries.
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        self.cache.sweep(now_ms)
    }

    /// Messages currently cached (for gateway push).
    pub fn cached_messages(&self) -> Vec<Message> {
        self.cache.messages()
    }

    pub fn is_cached(&self, id: &str) -> bool {
        self.cache.contains(id)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Set the delivered flag on a stored message.
    pub fn mark_delivered(&mut self, id: &str) -> bool {
        self.store.mark_delivered(id)
    }

    /// Encode a Forward action into one frame per target peer. Other actions produce nothing.
    pub fn outbound_frames(action: &Action) -> Result<Vec<(PeerAddress, Vec<u8>)>, FrameEncodeError> {
        match action {
            Action::Forward { to_peers, envelope } => {
                if to_peers.is_empty() {
                    return Ok(Vec::new());
                }
                let bytes = wire::encode_frame(&Frame::Relay(envelope.clone()))?;
                Ok(to_peers.iter().map(|p| (p.clone(), bytes.clone())).collect())
            }
            _ => Ok(Vec::new()),
        }
    }

    fn forward_targets(&self, from: Option<&PeerAddress>) -> Vec<PeerAddress> {
        match from {
            Some(origin) if self.config.split_horizon => {
                self.peers.iter().filter(|p| *p != origin).cloned().collect()
            }
            _ => self.peers.clone(),
        }
    }
}
