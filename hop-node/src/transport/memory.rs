//! In-process backend: nodes joined to one `MemoryNetwork` reach each other over duplex pipes.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hop_core::PeerAddress;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};

use super::{ConnectError, FrameSocket, Transport};

const PIPE_CAPACITY: usize = 64 * 1024;
const ACCEPT_BACKLOG: usize = 16;

/// Registry of joined nodes, keyed by address.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<Mutex<HashMap<PeerAddress, mpsc::Sender<DuplexStream>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `address` and return its transport. Joining twice replaces the earlier inbox.
    pub async fn join(&self, address: impl Into<PeerAddress>) -> MemoryTransport {
        let local = address.into();
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        self.nodes.lock().await.insert(local.clone(), tx);
        MemoryTransport {
            local,
            network: self.clone(),
            inbox: Mutex::new(rx),
            denied: AtomicBool::new(false),
        }
    }
}

pub struct MemoryTransport {
    local: PeerAddress,
    network: MemoryNetwork,
    inbox: Mutex<mpsc::Receiver<DuplexStream>>,
    denied: AtomicBool,
}

impl MemoryTransport {
    /// Make discovery and connect fail as if the platform refused them.
    pub fn set_permission_denied(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }

    fn check_permission(&self) -> Result<(), ConnectError> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(ConnectError::PermissionDenied);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_address(&self) -> &PeerAddress {
        &self.local
    }

    async fn discover(&self, window: Duration) -> Result<mpsc::Receiver<PeerAddress>, ConnectError> {
        self.check_permission()?;
        let mut others: Vec<PeerAddress> = {
            let nodes = self.network.nodes.lock().await;
            nodes.keys().filter(|a| **a != self.local).cloned().collect()
        };
        others.sort();
        let (tx, rx) = mpsc::channel(others.len().max(1));
        tokio::spawn(async move {
            for peer in others {
                if tx.send(peer).await.is_err() {
                    return;
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(window) => {}
                _ = tx.closed() => {}
            }
        });
        Ok(rx)
    }

    async fn connect(&self, peer: &PeerAddress) -> Result<FrameSocket, ConnectError> {
        self.check_permission()?;
        let inbox = self
            .network
            .nodes
            .lock()
            .await
            .get(peer)
            .cloned()
            .ok_or_else(|| ConnectError::UnknownPeer(peer.clone()))?;
        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        inbox.send(theirs).await.map_err(|_| {
            ConnectError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "peer not listening"))
        })?;
        let (read, write) = tokio::io::split(ours);
        FrameSocket::establish(read, write, &self.local).await
    }

    async fn accept(&self) -> Result<FrameSocket, ConnectError> {
        let stream = self.inbox.lock().await.recv().await.ok_or(ConnectError::Closed)?;
        let (read, write) = tokio::io::split(stream);
        FrameSocket::establish(read, write, &self.local).await
    }
}
