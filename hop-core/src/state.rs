//! Connection state machine: one node-global state derived from per-peer connections.

use std::collections::BTreeMap;
use std::fmt;

use crate::identity::PeerAddress;

/// Error string surfaced when the platform refuses a transport operation.
pub const MISSING_PERMISSIONS: &str = "Missing required permissions";

/// Node-global connectivity status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connected,
    Error(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Scanning => f.write_str("scanning"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Per-peer connection status. Ended connections are not tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Connecting,
    Open,
}

/// Why a peer connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Remote closed the stream cleanly.
    Eof,
    /// Socket I/O failed mid-session.
    Io(String),
    PermissionDenied,
    /// Local teardown.
    Shutdown,
}

/// A peer seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub address: PeerAddress,
    pub is_connected: bool,
}

/// Transition not allowed from the current state.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("discovery already running")]
    AlreadyScanning,
}

/// Tracks every peer connection and derives the aggregate `ConnectionState`.
/// Every transition returns the new state only when it changed.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    scanning: bool,
    peers: BTreeMap<PeerAddress, PeerStatus>,
    /// Dialed endpoint name -> address the remote announced in its handshake.
    aliases: BTreeMap<PeerAddress, PeerAddress>,
    discovered: Vec<PeerAddress>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            scanning: false,
            peers: BTreeMap::new(),
            aliases: BTreeMap::new(),
            discovered: Vec::new(),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn peer_status(&self, peer: &PeerAddress) -> Option<PeerStatus> {
        self.peers.get(peer).copied()
    }

    /// Address a dialed endpoint answered as, or `peer` itself when it never resolved elsewhere.
    pub fn resolve<'a>(&'a self, peer: &'a PeerAddress) -> &'a PeerAddress {
        self.aliases.get(peer).unwrap_or(peer)
    }

    /// Peers whose connection is open.
    pub fn open_peers(&self) -> Vec<PeerAddress> {
        self.peers
            .iter()
            .filter(|(_, s)| **s == PeerStatus::Open)
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// `Disconnected|Error -> Scanning`. With open connections the state stays `Connected`.
    pub fn start_discovery(&mut self) -> Result<Option<ConnectionState>, TransitionError> {
        if self.scanning {
            return Err(TransitionError::AlreadyScanning);
        }
        self.scanning = true;
        self.discovered.clear();
        if self.has_open() {
            return Ok(None);
        }
        Ok(self.set(ConnectionState::Scanning))
    }

    /// Discovery was stopped by the caller.
    pub fn stop_discovery(&mut self) -> Option<ConnectionState> {
        self.end_discovery()
    }

    /// Discovery session ended: `Scanning -> Disconnected` when nothing is open.
    pub fn on_discovery_finished(&mut self) -> Option<ConnectionState> {
        self.end_discovery()
    }

    /// Discovery could not run: `Error("Failed to start discovery: ..")` unless a connection is open.
    pub fn on_discovery_failed(&mut self, reason: &str) -> Option<ConnectionState> {
        self.scanning = false;
        if self.has_open() {
            return None;
        }
        self.set(ConnectionState::Error(format!(
            "Failed to start discovery: {reason}"
        )))
    }

    /// The platform refused a transport operation.
    pub fn on_permission_denied(&mut self) -> Option<ConnectionState> {
        self.scanning = false;
        self.set(ConnectionState::Error(MISSING_PERMISSIONS.to_string()))
    }

    /// Discovery reported a peer.
    pub fn on_peer_discovered(&mut self, peer: PeerAddress) -> bool {
        if self.discovered.contains(&peer) {
            return false;
        }
        self.discovered.push(peer);
        true
    }

    /// Peers seen in the current (or last) discovery session, listed under their resolved address.
    pub fn discovered_peers(&self) -> Vec<DiscoveredPeer> {
        let mut out: Vec<DiscoveredPeer> = Vec::new();
        for p in &self.discovered {
            let address = self.resolve(p);
            if out.iter().any(|d| &d.address == address) {
                continue;
            }
            out.push(DiscoveredPeer {
                address: address.clone(),
                is_connected: self.peer_status(address) == Some(PeerStatus::Open),
            });
        }
        out
    }

    /// Outbound connect attempt started. Returns false if the peer, or the address its endpoint
    /// resolved to, is already connecting or open.
    pub fn on_connect_started(&mut self, peer: PeerAddress) -> bool {
        if self.peers.contains_key(&peer) || self.peers.contains_key(self.resolve(&peer)) {
            return false;
        }
        self.peers.insert(peer, PeerStatus::Connecting);
        true
    }

    /// A dial to `endpoint` completed as `peer`. The pending entry moves to the real address and
    /// later dials of the endpoint are checked against it.
    pub fn on_endpoint_resolved(&mut self, endpoint: &PeerAddress, peer: PeerAddress) {
        if self.peers.get(endpoint) == Some(&PeerStatus::Connecting) {
            self.peers.remove(endpoint);
        }
        self.aliases.insert(endpoint.clone(), peer);
    }

    /// Peer socket established (outbound or accepted): `Scanning|Disconnected|Error -> Connected`.
    pub fn on_peer_connected(&mut self, peer: PeerAddress) -> Option<ConnectionState> {
        self.peers.insert(peer, PeerStatus::Open);
        self.set(ConnectionState::Connected)
    }

    /// Outbound connect failed before the socket opened.
    pub fn on_connect_failed(
        &mut self,
        peer: &PeerAddress,
        permission_denied: bool,
        reason: &str,
    ) -> Option<ConnectionState> {
        if self.peers.get(peer) == Some(&PeerStatus::Connecting) {
            self.peers.remove(peer);
        }
        if permission_denied {
            return self.on_permission_denied();
        }
        if self.has_open() || self.scanning {
            return None;
        }
        self.set(ConnectionState::Error(format!(
            "Socket connection failed: {reason}"
        )))
    }

    /// Open connection ended. Aggregate stays `Connected` while any other connection is open.
    pub fn on_peer_closed(&mut self, peer: &PeerAddress, reason: CloseReason) -> Option<ConnectionState> {
        if self.peers.remove(peer).is_none() {
            return None;
        }
        if self.has_open() {
            return None;
        }
        let next = match reason {
            CloseReason::Eof | CloseReason::Shutdown => {
                if self.scanning {
                    ConnectionState::Scanning
                } else {
                    ConnectionState::Disconnected
                }
            }
            CloseReason::Io(e) => ConnectionState::Error(format!("Connection lost: {e}")),
            CloseReason::PermissionDenied => ConnectionState::Error(MISSING_PERMISSIONS.to_string()),
        };
        self.set(next)
    }

    fn end_discovery(&mut self) -> Option<ConnectionState> {
        if !self.scanning {
            return None;
        }
        self.scanning = false;
        if self.state == ConnectionState::Scanning {
            return self.set(ConnectionState::Disconnected);
        }
        None
    }

    fn has_open(&self) -> bool {
        self.peers.values().any(|s| *s == PeerStatus::Open)
    }

    fn set(&mut self, next: ConnectionState) -> Option<ConnectionState> {
        if self.state == next {
            return None;
        }
        self.state = next.clone();
        Some(next)
    }
}
