use hop_core::{FrameEncodeError, PeerAddress, TransitionError};

/// Error returned by `NodeHandle` calls.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node is shut down")]
    Closed,
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error("peer {0} is not connected")]
    NotConnected(PeerAddress),
    #[error("peer {0} write queue rejected the frame")]
    PeerQueueFull(PeerAddress),
}
