//! Transport contract: discovery plus per-peer framed byte streams.
//! Backends: `socket` (UDP beacons + TCP), `group` (owner/member TCP link), `memory` (in-process pipes).

pub mod group;
pub mod memory;
pub mod socket;

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use hop_core::wire::{self, decode_control, encode_control, FrameDecodeError, LEN_SIZE};
use hop_core::{Frame, Hello, PeerAddress, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

pub use group::GroupTransport;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use socket::SocketTransport;

/// Upper bound for the hello exchange on a fresh stream.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Peer discovery and stream establishment. Backends are interchangeable behind this trait.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// This node's hop identifier, announced in beacons and the handshake.
    fn local_address(&self) -> &PeerAddress;

    /// Start one discovery session. Addresses arrive on the receiver until `window`
    /// elapses or the receiver is dropped.
    async fn discover(&self, window: Duration) -> Result<mpsc::Receiver<PeerAddress>, ConnectError>;

    /// Open a stream to `peer` and complete the handshake.
    async fn connect(&self, peer: &PeerAddress) -> Result<FrameSocket, ConnectError>;

    /// Wait for the next inbound stream and complete the handshake.
    async fn accept(&self) -> Result<FrameSocket, ConnectError>;
}

/// Failure to discover or to open a stream.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Missing required permissions")]
    PermissionDenied,
    #[error("{0}")]
    Io(io::Error),
    #[error("unknown peer {0}")]
    UnknownPeer(PeerAddress),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("transport closed")]
    Closed,
}

impl ConnectError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, ConnectError::PermissionDenied)
    }
}

impl From<io::Error> for ConnectError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::PermissionDenied {
            ConnectError::PermissionDenied
        } else {
            ConnectError::Io(e)
        }
    }
}

/// Failure reading the next frame from a stream.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// Remote closed the stream at a frame boundary.
    #[error("stream closed")]
    Closed,
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
    /// Frame body did not decode; the stream is still in sync.
    #[error("bad frame: {0}")]
    Framing(FrameDecodeError),
    /// Length header above the frame limit; the stream cannot resync.
    #[error("frame too large")]
    Oversize,
}

type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Read half of a peer stream. Owned by that peer's reader task.
pub struct FrameReader {
    inner: BoxRead,
    buf: Vec<u8>,
}

impl FrameReader {
    fn new(inner: BoxRead) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    /// Read one length-prefixed frame.
    pub async fn read_frame(&mut self) -> Result<Frame, ReadError> {
        self.read_body().await?;
        wire::decode_frame_body(&self.buf).map_err(ReadError::Framing)
    }

    async fn read_control(&mut self) -> Result<Hello, ReadError> {
        let mut header = [0u8; LEN_SIZE];
        read_header(&mut self.inner, &mut header).await?;
        let len = wire::frame_len(header).map_err(|_| ReadError::Oversize)?;
        let mut bytes = Vec::with_capacity(LEN_SIZE + len);
        bytes.extend_from_slice(&header);
        bytes.resize(LEN_SIZE + len, 0);
        self.inner.read_exact(&mut bytes[LEN_SIZE..]).await?;
        let (hello, _) = decode_control::<Hello>(&bytes).map_err(ReadError::Framing)?;
        Ok(hello)
    }

    async fn read_body(&mut self) -> Result<(), ReadError> {
        let mut header = [0u8; LEN_SIZE];
        read_header(&mut self.inner, &mut header).await?;
        let len = wire::frame_len(header).map_err(|_| ReadError::Oversize)?;
        self.buf.resize(len, 0);
        self.inner.read_exact(&mut self.buf).await?;
        Ok(())
    }
}

async fn read_header(inner: &mut BoxRead, header: &mut [u8; LEN_SIZE]) -> Result<(), ReadError> {
    match inner.read_exact(header).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(ReadError::Closed),
        Err(e) => Err(ReadError::Io(e)),
    }
}

/// Write half of a peer stream. Owned by that peer's writer task.
pub struct FrameWriter {
    inner: BoxWrite,
}

impl FrameWriter {
    fn new(inner: BoxWrite) -> Self {
        Self { inner }
    }

    /// Write one already-encoded frame (length prefix included).
    pub async fn write_frame(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// A handshaken stream to one peer.
pub struct FrameSocket {
    peer: PeerAddress,
    reader: FrameReader,
    writer: FrameWriter,
}

impl FrameSocket {
    /// Exchange `Hello` in both directions and return the socket named after the remote address.
    pub async fn establish<R, W>(read: R, write: W, local: &PeerAddress) -> Result<Self, ConnectError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut reader = FrameReader::new(Box::new(read));
        let mut writer = FrameWriter::new(Box::new(write));
        let exchange = async {
            let hello = encode_control(&Hello::new(local.clone()))
                .map_err(|e| ConnectError::Handshake(e.to_string()))?;
            writer.write_frame(&hello).await?;
            reader
                .read_control()
                .await
                .map_err(|e| ConnectError::Handshake(e.to_string()))
        };
        let remote = match tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange).await {
            Ok(r) => r?,
            Err(_) => return Err(ConnectError::Handshake("timed out".into())),
        };
        if remote.protocol_version != PROTOCOL_VERSION {
            return Err(ConnectError::Handshake(format!(
                "unsupported protocol version {}",
                remote.protocol_version
            )));
        }
        Ok(Self {
            peer: remote.address,
            reader,
            writer,
        })
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}
