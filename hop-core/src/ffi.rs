//! C ABI for linking hop-core as a static library from Android (NDK) or other C/C++ hosts.
//! The host owns the platform sockets; it feeds received frames in and writes returned frames out.

use std::ffi::{c_char, c_void, CStr};
use std::os::raw::c_int;
use std::slice;

use crate::engine::{Action, RelayEngine};
use crate::identity::PeerAddress;
use crate::protocol::{Frame, Message, PROTOCOL_VERSION};
use crate::wire::{decode_frame, encode_frame};

/// Result codes shared by the entry points below.
const ERR_ARG: c_int = -1;
const ERR_FRAME: c_int = -2;
const ERR_BUF: c_int = -3;

/// Returns the current protocol version. Used so the staticlib exports a C symbol and is linkable.
#[no_mangle]
pub extern "C" fn hop_core_version() -> u8 {
    PROTOCOL_VERSION
}

/// Create an engine for `address` (local hop id) and `username`, both NUL-terminated UTF-8.
/// Returns opaque handle or null on failure.
#[no_mangle]
pub extern "C" fn hop_core_create(address: *const c_char, username: *const c_char) -> *mut c_void {
    let (Some(address), Some(username)) = (unsafe { c_str(address) }, unsafe { c_str(username) })
    else {
        return std::ptr::null_mut();
    };
    let engine = RelayEngine::new(PeerAddress::new(address), username);
    Box::into_raw(Box::new(engine)) as *mut c_void
}

/// Destroy engine instance. No-op if h is null.
#[no_mangle]
pub extern "C" fn hop_core_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut RelayEngine) };
}

/// Peer connection opened. Returns 0 on success, -1 on bad arguments.
#[no_mangle]
pub extern "C" fn hop_core_peer_opened(h: *mut c_void, peer: *const c_char) -> c_int {
    let Some(engine) = (unsafe { engine_mut(h) }) else {
        return ERR_ARG;
    };
    let Some(peer) = (unsafe { c_str(peer) }) else {
        return ERR_ARG;
    };
    engine.on_peer_opened(PeerAddress::new(peer));
    0
}

/// Peer connection closed. Returns 0 on success, -1 on bad arguments.
#[no_mangle]
pub extern "C" fn hop_core_peer_closed(h: *mut c_void, peer: *const c_char) -> c_int {
    let Some(engine) = (unsafe { engine_mut(h) }) else {
        return ERR_ARG;
    };
    let Some(peer) = (unsafe { c_str(peer) }) else {
        return ERR_ARG;
    };
    engine.on_peer_closed(&PeerAddress::new(peer));
    0
}

/// One complete stream frame (length prefix included) received from `peer`.
/// Writes the outbound list to out_buf (see `write_outbound`).
/// Returns bytes written, -1 on bad arguments, -2 if the frame does not decode (drop it, keep the link),
/// -3 if out_buf is too small.
#[no_mangle]
pub extern "C" fn hop_core_on_frame(
    h: *mut c_void,
    peer: *const c_char,
    frame: *const u8,
    frame_len: usize,
    now_ms: u64,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    let Some(engine) = (unsafe { engine_mut(h) }) else {
        return ERR_ARG;
    };
    let Some(peer) = (unsafe { c_str(peer) }) else {
        return ERR_ARG;
    };
    if frame.is_null() {
        return ERR_ARG;
    }
    let bytes = unsafe { slice::from_raw_parts(frame, frame_len) };
    let (decoded, _) = match decode_frame(bytes) {
        Ok(x) => x,
        Err(_) => return ERR_FRAME,
    };
    let from = PeerAddress::new(peer);
    let action = engine.handle_frame(decoded, Some(&from), now_ms);
    write_action(&action, out_buf, out_buf_len)
}

/// Originate a message from this node's user to `receiver`. Writes the outbound list to out_buf.
/// Returns bytes written, -1 on bad arguments, -3 if out_buf is too small.
#[no_mangle]
pub extern "C" fn hop_core_send(
    h: *mut c_void,
    receiver: *const c_char,
    content: *const c_char,
    now_ms: u64,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    let Some(engine) = (unsafe { engine_mut(h) }) else {
        return ERR_ARG;
    };
    let (Some(receiver), Some(content)) = (unsafe { c_str(receiver) }, unsafe { c_str(content) })
    else {
        return ERR_ARG;
    };
    let message = Message::new(engine.username().to_string(), receiver, content, now_ms);
    let action = engine.send(message, now_ms);
    write_action(&action, out_buf, out_buf_len)
}

/// A message pulled from the directory service (fields as NUL-terminated UTF-8).
/// Writes the action list to out_buf; an id already cached yields kind 2 with no entries.
/// Returns bytes written, -1 on bad arguments, -3 if out_buf is too small.
#[no_mangle]
pub extern "C" fn hop_core_inject_directory(
    h: *mut c_void,
    id: *const c_char,
    sender: *const c_char,
    receiver: *const c_char,
    content: *const c_char,
    timestamp_ms: u64,
    now_ms: u64,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    let Some(engine) = (unsafe { engine_mut(h) }) else {
        return ERR_ARG;
    };
    let fields = unsafe { (c_str(id), c_str(sender), c_str(receiver), c_str(content)) };
    let (Some(id), Some(sender), Some(receiver), Some(content)) = fields else {
        return ERR_ARG;
    };
    let mut message = Message::new(sender, receiver, content, timestamp_ms);
    message.id = id.to_string();
    let action = engine
        .inject_from_directory(message, now_ms)
        .unwrap_or(Action::DropDuplicate);
    write_action(&action, out_buf, out_buf_len)
}

/// Encode a bare local-delivery frame from this node's user to `receiver`, for writing to one
/// connected peer. Not cached, recorded, or relayed.
/// Returns frame length, -1 on bad arguments, -3 if out_buf is too small.
#[no_mangle]
pub extern "C" fn hop_core_local_frame(
    h: *mut c_void,
    receiver: *const c_char,
    content: *const c_char,
    now_ms: u64,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    let Some(engine) = (unsafe { engine_mut(h) }) else {
        return ERR_ARG;
    };
    let (Some(receiver), Some(content)) = (unsafe { c_str(receiver) }, unsafe { c_str(content) })
    else {
        return ERR_ARG;
    };
    let message = Message::new(engine.username().to_string(), receiver, content, now_ms);
    let Ok(bytes) = encode_frame(&Frame::LocalMessage(message)) else {
        return ERR_FRAME;
    };
    if out_buf.is_null() || out_buf_len < bytes.len() || bytes.len() > c_int::MAX as usize {
        return ERR_BUF;
    }
    let buf = unsafe { slice::from_raw_parts_mut(out_buf, out_buf_len) };
    buf[..bytes.len()].copy_from_slice(&bytes);
    bytes.len() as c_int
}

/// Set the delivered flag on a stored message (after the directory confirmed it).
/// Returns 1 if the id was stored, 0 if not, -1 on bad arguments.
#[no_mangle]
pub extern "C" fn hop_core_mark_delivered(h: *mut c_void, id: *const c_char) -> c_int {
    let Some(engine) = (unsafe { engine_mut(h) }) else {
        return ERR_ARG;
    };
    let Some(id) = (unsafe { c_str(id) }) else {
        return ERR_ARG;
    };
    engine.mark_delivered(id) as c_int
}

/// TTL sweep. Returns the number of evicted cache entries, or -1 if h is null.
#[no_mangle]
pub extern "C" fn hop_core_sweep(h: *mut c_void, now_ms: u64) -> c_int {
    let Some(engine) = (unsafe { engine_mut(h) }) else {
        return ERR_ARG;
    };
    engine.sweep(now_ms).min(c_int::MAX as usize) as c_int
}

/// Number of messages in the store, or -1 if h is null.
#[no_mangle]
pub extern "C" fn hop_core_store_len(h: *mut c_void) -> c_int {
    let Some(engine) = (unsafe { engine_mut(h) }) else {
        return ERR_ARG;
    };
    engine.store().len().min(c_int::MAX as usize) as c_int
}

/// Serialize an action to out_buf:
/// 1 byte kind (0 deliver, 1 forward, 2 duplicate, 3 expired, 4 hop limit), 4 bytes count (LE),
/// then each (2 bytes peer len LE, peer, 4 bytes frame len LE, frame).
/// Forward has one entry per target peer. Deliver has one entry with an empty peer whose frame is
/// the delivered message as a local-delivery frame.
/// Returns number of bytes written, -2 if encoding failed, or -3 if out_buf is null or too small.
fn write_action(action: &Action, out_buf: *mut u8, out_buf_len: usize) -> c_int {
    let kind: u8 = match action {
        Action::Deliver { .. } => 0,
        Action::Forward { .. } => 1,
        Action::DropDuplicate => 2,
        Action::DropExpired => 3,
        Action::DropHopLimit => 4,
    };
    let encoded = match action {
        Action::Deliver { message, .. } => encode_frame(&Frame::LocalMessage(message.clone()))
            .map(|bytes| vec![(PeerAddress::new(""), bytes)]),
        _ => RelayEngine::outbound_frames(action),
    };
    let Ok(frames) = encoded else {
        return ERR_FRAME;
    };
    let mut need = 1 + 4;
    for (peer, bytes) in &frames {
        need += 2 + peer.as_str().len() + 4 + bytes.len();
    }
    if out_buf.is_null() || out_buf_len < need || need > c_int::MAX as usize {
        return ERR_BUF;
    }
    let buf = unsafe { slice::from_raw_parts_mut(out_buf, out_buf_len) };
    buf[0] = kind;
    buf[1..5].copy_from_slice(&(frames.len() as u32).to_le_bytes());
    let mut off = 5;
    for (peer, bytes) in &frames {
        let p = peer.as_str().as_bytes();
        buf[off..off + 2].copy_from_slice(&(p.len() as u16).to_le_bytes());
        off += 2;
        buf[off..off + p.len()].copy_from_slice(p);
        off += p.len();
        buf[off..off + 4].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
        off += 4;
        buf[off..off + bytes.len()].copy_from_slice(bytes);
        off += bytes.len();
    }
    off as c_int
}

unsafe fn engine_mut<'a>(h: *mut c_void) -> Option<&'a mut RelayEngine> {
    if h.is_null() {
        return None;
    }
    Some(&mut *(h as *mut RelayEngine))
}

unsafe fn c_str<'a>(p: *const c_char) -> Option<&'a str> {
    if p.is_null() {
        return None;
    }
    CStr::from_ptr(p).to_str().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RelayEnvelope;
    use std::ffi::CString;

    /// Entries of an encoded action list.
    fn entries(out: &[u8]) -> Vec<(String, Vec<u8>)> {
        let count = u32::from_le_bytes([out[1], out[2], out[3], out[4]]) as usize;
        let mut off = 5;
        let mut list = Vec::new();
        for _ in 0..count {
            let plen = u16::from_le_bytes([out[off], out[off + 1]]) as usize;
            off += 2;
            let peer = String::from_utf8(out[off..off + plen].to_vec()).unwrap();
            off += plen;
            let flen = u32::from_le_bytes(out[off..off + 4].try_into().unwrap()) as usize;
            off += 4;
            list.push((peer, out[off..off + flen].to_vec()));
            off += flen;
        }
        list
    }

    #[test]
    fn send_writes_forward_frames() {
        let addr = CString::new("X").unwrap();
        let user = CString::new("x").unwrap();
        let h = hop_core_create(addr.as_ptr(), user.as_ptr());
        assert!(!h.is_null());
        let peer = CString::new("Y").unwrap();
        assert_eq!(hop_core_peer_opened(h, peer.as_ptr()), 0);

        let to = CString::new("z").unwrap();
        let text = CString::new("hi").unwrap();
        let mut out = vec![0u8; 4096];
        let n = hop_core_send(h, to.as_ptr(), text.as_ptr(), 1_000, out.as_mut_ptr(), out.len());
        assert!(n > 5);
        assert_eq!(out[0], 1);
        assert_eq!(u32::from_le_bytes([out[1], out[2], out[3], out[4]]), 1);
        let peer_len = u16::from_le_bytes([out[5], out[6]]) as usize;
        assert_eq!(&out[7..7 + peer_len], b"Y");
        assert_eq!(hop_core_store_len(h), 1);
        hop_core_destroy(h);
    }

    #[test]
    fn on_frame_delivers_and_rejects_garbage() {
        let addr = CString::new("Z").unwrap();
        let user = CString::new("z").unwrap();
        let h = hop_core_create(addr.as_ptr(), user.as_ptr());
        let peer = CString::new("Y").unwrap();

        let env = RelayEnvelope::new(Message::new("x", "z", "hi", 0), vec![], 10, 10_000);
        let frame = encode_frame(&Frame::Relay(env.clone())).unwrap();
        let mut out = vec![0u8; 1024];
        let n = hop_core_on_frame(h, peer.as_ptr(), frame.as_ptr(), frame.len(), 5, out.as_mut_ptr(), out.len());
        assert!(n > 5);
        assert_eq!(out[0], 0);
        let list = entries(&out);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].0, "");
        let (delivered, _) = decode_frame(&list[0].1).unwrap();
        assert_eq!(delivered, Frame::LocalMessage(env.message));

        let again = hop_core_on_frame(h, peer.as_ptr(), frame.as_ptr(), frame.len(), 6, out.as_mut_ptr(), out.len());
        assert_eq!(again, 5);
        assert_eq!(out[0], 2);

        let garbage = [1u8, 0, 0, 0, 0x09];
        let n = hop_core_on_frame(h, peer.as_ptr(), garbage.as_ptr(), garbage.len(), 5, out.as_mut_ptr(), out.len());
        assert_eq!(n, ERR_FRAME);
        assert_eq!(hop_core_store_len(h), 1);
        hop_core_destroy(h);
    }

    #[test]
    fn directory_message_delivered_once_and_marked() {
        let addr = CString::new("A").unwrap();
        let user = CString::new("alice").unwrap();
        let h = hop_core_create(addr.as_ptr(), user.as_ptr());
        let id = CString::new("s1").unwrap();
        let from = CString::new("bob").unwrap();
        let text = CString::new("from the directory").unwrap();
        let mut out = vec![0u8; 1024];

        let n = hop_core_inject_directory(
            h, id.as_ptr(), from.as_ptr(), user.as_ptr(), text.as_ptr(), 7, 10, out.as_mut_ptr(), out.len(),
        );
        assert!(n > 5);
        assert_eq!(out[0], 0);
        match decode_frame(&entries(&out)[0].1).unwrap().0 {
            Frame::LocalMessage(m) => {
                assert_eq!(m.id, "s1");
                assert_eq!(m.content, "from the directory");
                assert_eq!(m.timestamp_ms, 7);
            }
            other => panic!("expected local message, got {other:?}"),
        }

        let n = hop_core_inject_directory(
            h, id.as_ptr(), from.as_ptr(), user.as_ptr(), text.as_ptr(), 7, 11, out.as_mut_ptr(), out.len(),
        );
        assert_eq!(n, 5);
        assert_eq!(out[0], 2);
        assert_eq!(hop_core_mark_delivered(h, id.as_ptr()), 1);
        let missing = CString::new("nope").unwrap();
        assert_eq!(hop_core_mark_delivered(h, missing.as_ptr()), 0);
        hop_core_destroy(h);
    }

    #[test]
    fn local_frame_is_not_recorded() {
        let addr = CString::new("A").unwrap();
        let user = CString::new("alice").unwrap();
        let h = hop_core_create(addr.as_ptr(), user.as_ptr());
        let to = CString::new("bob").unwrap();
        let text = CString::new("direct").unwrap();
        let mut out = vec![0u8; 256];
        let n = hop_core_local_frame(h, to.as_ptr(), text.as_ptr(), 3, out.as_mut_ptr(), out.len());
        assert!(n > 0);
        match decode_frame(&out[..n as usize]).unwrap() {
            (Frame::LocalMessage(m), used) => {
                assert_eq!(used, n as usize);
                assert_eq!((m.sender.as_str(), m.receiver.as_str()), ("alice", "bob"));
            }
            other => panic!("expected local message, got {other:?}"),
        }
        assert_eq!(hop_core_store_len(h), 0);
        assert_eq!(hop_core_local_frame(h, to.as_ptr(), text.as_ptr(), 3, out.as_mut_ptr(), 2), ERR_BUF);
        hop_core_destroy(h);
    }

    #[test]
    fn null_handle_rejected() {
        assert_eq!(hop_core_sweep(std::ptr::null_mut(), 0), ERR_ARG);
        assert!(hop_core_create(std::ptr::null(), std::ptr::null()).is_null());
    }
}
