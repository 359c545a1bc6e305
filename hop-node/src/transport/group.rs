//! Group link backend: one owner listens, members dial the owner's configured endpoint.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use hop_core::PeerAddress;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::socket::establish_tcp;
use super::{ConnectError, FrameSocket, Transport};

enum Role {
    Owner(TcpListener),
    Member { owner: SocketAddr },
}

pub struct GroupTransport {
    local: PeerAddress,
    role: Role,
}

impl GroupTransport {
    /// Group owner: accept members on `listen`.
    pub async fn owner(local: PeerAddress, listen: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            local,
            role: Role::Owner(TcpListener::bind(listen).await?),
        })
    }

    /// Group member: the only reachable peer is the owner at `owner`.
    pub fn member(local: PeerAddress, owner: SocketAddr) -> Self {
        Self {
            local,
            role: Role::Member { owner },
        }
    }

    pub fn is_owner(&self) -> bool {
        matches!(self.role, Role::Owner(_))
    }

    /// Owner's listen endpoint.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        match &self.role {
            Role::Owner(l) => l.local_addr().ok(),
            Role::Member { .. } => None,
        }
    }

    /// Discovery name of the owner endpoint. The real hop address is learned in the handshake.
    pub fn owner_endpoint(owner: SocketAddr) -> PeerAddress {
        PeerAddress::new(owner.to_string())
    }
}

#[async_trait]
impl Transport for GroupTransport {
    fn local_address(&self) -> &PeerAddress {
        &self.local
    }

    async fn discover(&self, _window: Duration) -> Result<mpsc::Receiver<PeerAddress>, ConnectError> {
        let (tx, rx) = mpsc::channel(1);
        if let Role::Member { owner } = &self.role {
            let _ = tx.try_send(Self::owner_endpoint(*owner));
        }
        Ok(rx)
    }

    async fn connect(&self, peer: &PeerAddress) -> Result<FrameSocket, ConnectError> {
        match &self.role {
            Role::Member { owner } => {
                let stream = TcpStream::connect(*owner).await?;
                establish_tcp(stream, &self.local).await
            }
            Role::Owner(_) => Err(ConnectError::UnknownPeer(peer.clone())),
        }
    }

    async fn accept(&self) -> Result<FrameSocket, ConnectError> {
        match &self.role {
            Role::Owner(listener) => {
                let (stream, _) = listener.accept().await?;
                establish_tcp(stream, &self.local).await
            }
            Role::Member { .. } => std::future::pending().await,
        }
    }
}
