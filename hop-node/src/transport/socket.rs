//! Short-range socket mesh: UDP multicast beacons for discovery, TCP streams per peer.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hop_core::wire::{decode_control, encode_control};
use hop_core::{Beacon, PeerAddress, PROTOCOL_VERSION};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};

use super::{ConnectError, FrameSocket, Transport};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);

pub struct SocketTransport {
    local: PeerAddress,
    discovery_port: u16,
    listener: TcpListener,
    listen_port: u16,
    /// Peer address -> TCP endpoint, learned from beacons or added explicitly.
    book: Arc<Mutex<HashMap<PeerAddress, SocketAddr>>>,
}

impl SocketTransport {
    /// Bind the TCP listener. Port 0 picks a free port (see `listen_addr`).
    pub async fn bind(local: PeerAddress, listen: SocketAddr, discovery_port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        let listen_port = listener.local_addr()?.port();
        Ok(Self {
            local,
            discovery_port,
            listener,
            listen_port,
            book: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn listen_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Teach the address book where `peer` listens, bypassing discovery.
    pub async fn add_peer_addr(&self, peer: PeerAddress, addr: SocketAddr) {
        self.book.lock().await.insert(peer, addr);
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn local_address(&self) -> &PeerAddress {
        &self.local
    }

    async fn discover(&self, window: Duration) -> Result<mpsc::Receiver<PeerAddress>, ConnectError> {
        let socket = make_multicast_socket(self.discovery_port)?;
        let beacon = encode_control(&Beacon {
            protocol_version: PROTOCOL_VERSION,
            address: self.local.clone(),
            listen_port: self.listen_port,
        })
        .map_err(|e| ConnectError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        let dest = SocketAddr::from((MULTICAST_GROUP, self.discovery_port));
        let (tx, rx) = mpsc::channel(32);
        let book = self.book.clone();
        let local = self.local.clone();
        tokio::spawn(async move {
            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);
            let mut ticker = tokio::time::interval(BEACON_INTERVAL);
            let mut seen = HashSet::new();
            let mut buf = vec![0u8; 2048];
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = socket.send_to(&beacon, dest).await {
                            tracing::warn!("discovery: beacon send failed: {e}");
                        }
                    }
                    r = socket.recv_from(&mut buf) => {
                        let (n, from) = match r {
                            Ok(x) => x,
                            Err(e) => {
                                tracing::warn!("discovery: receive failed: {e}");
                                break;
                            }
                        };
                        let Ok((remote, _)) = decode_control::<Beacon>(&buf[..n]) else {
                            continue;
                        };
                        if remote.protocol_version != PROTOCOL_VERSION || remote.address == local {
                            continue;
                        }
                        book.lock()
                            .await
                            .insert(remote.address.clone(), SocketAddr::new(from.ip(), remote.listen_port));
                        if seen.insert(remote.address.clone()) {
                            // Answer directly so the remote learns us without waiting a full interval.
                            let _ = socket.send_to(&beacon, from).await;
                            if tx.send(remote.address).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn connect(&self, peer: &PeerAddress) -> Result<FrameSocket, ConnectError> {
        let addr = self
            .book
            .lock()
            .await
            .get(peer)
            .copied()
            .ok_or_else(|| ConnectError::UnknownPeer(peer.clone()))?;
        let socket = establish_tcp(TcpStream::connect(addr).await?, &self.local).await?;
        if socket.peer() != peer {
            return Err(ConnectError::Handshake(format!(
                "expected {peer}, endpoint answered as {}",
                socket.peer()
            )));
        }
        Ok(socket)
    }

    async fn accept(&self) -> Result<FrameSocket, ConnectError> {
        let (stream, from) = self.listener.accept().await?;
        let socket = establish_tcp(stream, &self.local).await?;
        self.book.lock().await.entry(socket.peer().clone()).or_insert(from);
        Ok(socket)
    }
}

/// Handshake over a fresh TCP stream.
pub(crate) async fn establish_tcp(stream: TcpStream, local: &PeerAddress) -> Result<FrameSocket, ConnectError> {
    stream.set_nodelay(true)?;
    let (read, write) = stream.into_split();
    FrameSocket::establish(read, write, local).await
}

fn make_multicast_socket(discovery_port: u16) -> io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bound(name: &str) -> SocketTransport {
        SocketTransport::bind(PeerAddress::from(name), "127.0.0.1:0".parse().unwrap(), 0)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn connect_over_loopback() {
        let a = bound("A").await;
        let b = bound("B").await;
        a.add_peer_addr(PeerAddress::from("B"), b.listen_addr().unwrap()).await;
        let addr = PeerAddress::from("B");
        let (out, inc) = tokio::join!(a.connect(&addr), b.accept());
        assert_eq!(out.unwrap().peer(), &PeerAddress::from("B"));
        assert_eq!(inc.unwrap().peer(), &PeerAddress::from("A"));
    }

    #[tokio::test]
    async fn wrong_identity_rejected() {
        let a = bound("A").await;
        let b = bound("B").await;
        a.add_peer_addr(PeerAddress::from("C"), b.listen_addr().unwrap()).await;
        let addr = PeerAddress::from("C");
        let (out, _inc) = tokio::join!(a.connect(&addr), b.accept());
        assert!(matches!(out, Err(ConnectError::Handshake(_))));
    }

    #[tokio::test]
    async fn unknown_peer_without_beacon() {
        let a = bound("A").await;
        assert!(matches!(
            a.connect(&PeerAddress::from("ghost")).await,
            Err(ConnectError::UnknownPeer(_))
        ));
    }
}
