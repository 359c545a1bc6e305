//! Hop mesh relay core.
//! Host-driven: no I/O; host passes frames and peer events, and receives actions.

pub mod cache;
pub mod engine;
pub mod ffi;
pub mod identity;
pub mod protocol;
pub mod state;
pub mod store;
pub mod wire;

pub use cache::DedupCache;
pub use engine::{Action, RelayConfig, RelayEngine};
pub use identity::PeerAddress;
pub use protocol::{
    Beacon, Frame, Hello, Message, RelayEnvelope, DEFAULT_MAX_HOPS, DEFAULT_TTL_MS,
    PROTOCOL_VERSION,
};
pub use state::{
    CloseReason, ConnectionState, ConnectionStateMachine, DiscoveredPeer, PeerStatus,
    TransitionError, MISSING_PERMISSIONS,
};
pub use store::MessageStore;
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
