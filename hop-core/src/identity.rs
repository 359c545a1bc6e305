//! Node identity: hop identifiers recorded in envelope routes and used as transport addresses.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Length in bytes of a generated node identifier (hex-encoded to twice this).
pub const GENERATED_ID_LEN: usize = 16;

/// Transport address of a peer. Unique per node; also the hop identifier appended to routes.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        PeerAddress(address.into())
    }

    /// Random identifier for a node that has no stable hardware address.
    pub fn generate() -> Self {
        let mut bytes = [0u8; GENERATED_ID_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        PeerAddress(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(s: &str) -> Self {
        PeerAddress(s.to_string())
    }
}

impl From<String> for PeerAddress {
    fn from(s: String) -> Self {
        PeerAddress(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_addresses_are_hex_and_distinct() {
        let a = PeerAddress::generate();
        let b = PeerAddress::generate();
        assert_eq!(a.as_str().len(), GENERATED_ID_LEN * 2);
        assert_eq!(hex::decode(a.as_str()).unwrap().len(), GENERATED_ID_LEN);
        assert_eq!(a.as_str(), a.as_str().to_lowercase());
        assert_ne!(a, b);
    }

    #[test]
    fn short_form_truncates() {
        let a = PeerAddress::new("0123456789abcdef");
        assert_eq!(a.short(), "01234567");
        let b = PeerAddress::new("ab");
        assert_eq!(b.short(), "ab");
    }
}
