//! Dedup cache: envelope id -> first-seen envelope, evicted only by TTL sweep.
//!
//! There is no size bound. A flood of distinct ids grows the cache until their
//! envelopes expire; this is an accepted resource risk, not a guarantee.

use std::collections::HashMap;

use crate::protocol::{Message, RelayEnvelope};

/// Envelopes seen by this node, keyed by envelope id. First seen wins.
#[derive(Debug, Default)]
pub struct DedupCache {
    entries: HashMap<String, RelayEnvelope>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, envelope_id: &str) -> bool {
        self.entries.contains_key(envelope_id)
    }

    /// Insert unless the id is already present. Returns true if inserted.
    /// An existing entry is never replaced.
    pub fn insert_if_absent(&mut self, envelope: RelayEnvelope) -> bool {
        if self.entries.contains_key(envelope.envelope_id()) {
            return false;
        }
        self.entries
            .insert(envelope.envelope_id().to_string(), envelope);
        true
    }

    pub fn get(&self, envelope_id: &str) -> Option<&RelayEnvelope> {
        self.entries.get(envelope_id)
    }

    /// Remove every entry whose expiry is at or before `now_ms`. Returns how many were removed.
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at_ms > now_ms);
        before - self.entries.len()
    }

    /// Snapshot of the cached messages (for gateway push).
    pub fn messages(&self) -> Vec<Message> {
        self.entries.values().map(|e| e.message.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(id: &str, expires_at_ms: u64) -> RelayEnvelope {
        let mut m = Message::new("x", "z", id, 0);
        m.id = id.to_string();
        RelayEnvelope::new(m, vec![], 10, expires_at_ms)
    }

    #[test]
    fn first_seen_wins() {
        let mut cache = DedupCache::new();
        assert!(cache.insert_if_absent(env("m1", 100)));
        let mut later = env("m1", 900);
        later.message.content = "other".into();
        assert!(!cache.insert_if_absent(later));
        assert_eq!(cache.get("m1").unwrap().expires_at_ms, 100);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn sweep_removes_expired_and_boundary() {
        let mut cache = DedupCache::new();
        cache.insert_if_absent(env("old", 50));
        cache.insert_if_absent(env("edge", 100));
        cache.insert_if_absent(env("fresh", 101));
        assert_eq!(cache.sweep(100), 2);
        assert!(cache.contains("fresh"));
        assert!(!cache.contains("edge"));
        assert!(!cache.contains("old"));
    }

    #[test]
    fn survivors_expire_by_next_sweep() {
        let mut cache = DedupCache::new();
        cache.insert_if_absent(env("a", 150));
        assert_eq!(cache.sweep(100), 0);
        assert_eq!(cache.sweep(160), 1);
        assert!(cache.is_empty());
    }
}
