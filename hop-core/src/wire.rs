//! Framing: length-prefix (4 bytes LE) + tag byte + bincode payload.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::{Frame, Message, RelayEnvelope};

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 1024 * 1024; // 1 MiB

/// Tag for a bare local-delivery `Message` frame.
pub const TAG_LOCAL_MESSAGE: u8 = 0x01;
/// Tag for a `RelayEnvelope` frame.
pub const TAG_RELAY: u8 = 0x02;

/// Encode a frame: 4 bytes LE length, then tag, then bincode body. Length covers tag + body.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
    let (tag, body) = match frame {
        Frame::LocalMessage(m) => (TAG_LOCAL_MESSAGE, bincode::serialize(m)?),
        Frame::Relay(e) => (TAG_RELAY, bincode::serialize(e)?),
    };
    let len = body.len() + 1;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + len);
    out.extend_from_slice(&(len as u32).to_le_bytes());
    out.push(tag);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Error encoding a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let frame = decode_frame_body(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((frame, LEN_SIZE + len))
}

/// Body length announced by a 4-byte header. Rejects lengths above `MAX_FRAME_LEN`.
pub fn frame_len(header: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode a frame body (tag + bincode payload) whose length prefix was already consumed.
pub fn decode_frame_body(body: &[u8]) -> Result<Frame, FrameDecodeError> {
    let (&tag, payload) = body.split_first().ok_or(FrameDecodeError::Empty)?;
    match tag {
        TAG_LOCAL_MESSAGE => {
            let m: Message = bincode::deserialize(payload)?;
            Ok(Frame::LocalMessage(m))
        }
        TAG_RELAY => {
            let e: RelayEnvelope = bincode::deserialize(payload)?;
            Ok(Frame::Relay(e))
        }
        other => Err(FrameDecodeError::UnknownTag(other)),
    }
}

/// Error decoding a frame (need more bytes, too large, bad tag, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("empty frame")]
    Empty,
    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

impl FrameDecodeError {
    /// Whether the stream can continue after this error. Only an oversize header loses sync.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FrameDecodeError::TooLarge)
    }
}

/// Encode an untagged control payload (beacon, handshake): 4 bytes LE length + bincode.
pub fn encode_control<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(value)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode an untagged control payload from the front of `bytes`.
pub fn decode_control<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let value: T = bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((value, LEN_SIZE + len))
}
