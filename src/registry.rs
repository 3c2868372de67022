//! Identity Registry
//!
//! Hands out short, human-shareable peer ids and keeps them bound 1:1 to
//! live connection handles.

use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Default)]
struct Bindings {
    /// peer id -> connection handle
    by_peer: HashMap<String, String>,
    /// connection handle -> peer id
    by_handle: HashMap<String, String>,
}

impl Bindings {
    fn bind(&mut self, peer_id: String, handle: &str) -> String {
        self.by_peer.insert(peer_id.clone(), handle.to_string());
        self.by_handle.insert(handle.to_string(), peer_id.clone());
        peer_id
    }
}

/// Bidirectional `peer id <-> connection handle` mapping.
///
/// Every operation takes the lock once, so allocate/release/resolve are each
/// a single atomic step with respect to one another.
#[derive(Debug)]
pub struct IdentityRegistry {
    id_length: usize,
    bindings: RwLock<Bindings>,
}

impl IdentityRegistry {
    pub fn new(id_length: usize) -> Self {
        Self {
            id_length: id_length.max(1),
            bindings: RwLock::new(Bindings::default()),
        }
    }

    /// Mint a fresh connection handle
    pub fn new_handle() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Assign a peer id to a connection.
    ///
    /// The id starts as a prefix of the handle and grows one character at a
    /// time on collision. Once the whole handle is used up, random base-36
    /// characters are appended until the id is free.
    pub fn allocate(&self, handle: &str) -> String {
        let mut bindings = self.bindings.write();
        if let Some(existing) = bindings.by_handle.get(handle) {
            return existing.clone();
        }

        let chars: Vec<char> = handle.chars().collect();
        let start = self.id_length.min(chars.len());
        for len in start..=chars.len() {
            let candidate: String = chars[..len].iter().collect();
            if !candidate.is_empty() && !bindings.by_peer.contains_key(&candidate) {
                return bindings.bind(candidate, handle);
            }
        }

        let mut candidate = handle.to_string();
        loop {
            candidate.push(random_base36());
            if !bindings.by_peer.contains_key(&candidate) {
                log::debug!("Peer id for {} extended past handle length", handle);
                return bindings.bind(candidate, handle);
            }
        }
    }

    /// Drop both directions of the mapping for a connection.
    ///
    /// Returns the released peer id; unknown handles are a no-op.
    pub fn release(&self, handle: &str) -> Option<String> {
        let mut bindings = self.bindings.write();
        let peer_id = bindings.by_handle.remove(handle)?;
        bindings.by_peer.remove(&peer_id);
        Some(peer_id)
    }

    /// Find the live connection addressed by `raw_id`.
    ///
    /// Peer ids take precedence; a raw connection handle is accepted only if
    /// it belongs to a live connection.
    pub fn resolve(&self, raw_id: &str) -> Option<String> {
        let id = raw_id.trim();
        if id.is_empty() {
            return None;
        }

        let bindings = self.bindings.read();
        if let Some(handle) = bindings.by_peer.get(id) {
            return Some(handle.clone());
        }
        if bindings.by_handle.contains_key(id) {
            return Some(id.to_string());
        }
        None
    }

    /// The peer id currently bound to a connection
    pub fn peer_id_of(&self, handle: &str) -> Option<String> {
        self.bindings.read().by_handle.get(handle).cloned()
    }

    pub fn len(&self) -> usize {
        self.bindings.read().by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IdentityRegistry {
    fn default() -> Self {
        Self::new(4)
    }
}

fn random_base36() -> char {
    let byte = Uuid::new_v4().as_bytes()[0];
    BASE36[byte as usize % BASE36.len()] as char
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_allocate_uses_prefix() {
        let registry = IdentityRegistry::new(4);
        let id = registry.allocate("abcdef123456");
        assert_eq!(id, "abcd");
        assert_eq!(registry.resolve("abcd").as_deref(), Some("abcdef123456"));
    }

    #[test]
    fn test_collision_extends_prefix() {
        let registry = IdentityRegistry::new(4);
        assert_eq!(registry.allocate("abcd1111"), "abcd");
        assert_eq!(registry.allocate("abcd2222"), "abcd2");
        assert_eq!(registry.allocate("abcd2233"), "abcd22");
    }

    #[test]
    fn test_collision_past_handle_length() {
        let registry = IdentityRegistry::new(4);
        assert_eq!(registry.allocate("abcdxyz"), "abcd");
        assert_eq!(registry.allocate("abcdx"), "abcdx");
        // Every prefix of "abcd" is "abcd" itself or shorter than the id length
        let id = registry.allocate("abcd");
        assert!(id.len() >= 5);
        assert!(id.starts_with("abcd"));
        assert_ne!(id, "abcdx");
        assert_eq!(registry.resolve(&id).as_deref(), Some("abcd"));
    }

    #[test]
    fn test_allocate_same_handle_twice() {
        let registry = IdentityRegistry::new(4);
        let first = registry.allocate("abcdef");
        let second = registry.allocate("abcdef");
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_uniqueness_under_churn() {
        let registry = IdentityRegistry::new(1);
        let mut live: Vec<String> = Vec::new();

        for round in 0..200 {
            let handle = format!("{}{}", round % 7, IdentityRegistry::new_handle());
            live.push(handle.clone());
            registry.allocate(&handle);

            if round % 3 == 0 {
                let gone = live.remove(round % live.len());
                registry.release(&gone);
            }

            let ids: HashSet<String> = live
                .iter()
                .map(|h| registry.peer_id_of(h).unwrap())
                .collect();
            assert_eq!(ids.len(), live.len());
            assert_eq!(registry.len(), live.len());
        }
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry = IdentityRegistry::new(4);
        registry.allocate("abcdef");

        assert_eq!(registry.release("abcdef").as_deref(), Some("abcd"));
        assert!(registry.release("abcdef").is_none());
        assert!(registry.release("never-seen").is_none());
        assert!(registry.resolve("abcd").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_resolve_rules() {
        let registry = IdentityRegistry::new(4);
        registry.allocate("abcdef");

        assert_eq!(registry.resolve("  abcd \n").as_deref(), Some("abcdef"));
        assert_eq!(registry.resolve("abcdef").as_deref(), Some("abcdef"));
        assert!(registry.resolve("").is_none());
        assert!(registry.resolve("   ").is_none());
        assert!(registry.resolve("zzzz").is_none());
    }

    #[test]
    fn test_peer_id_wins_over_handle() {
        let registry = IdentityRegistry::new(4);
        // Peer id "abcd" and a connection whose raw handle is literally "abcd"
        registry.allocate("abcdef");
        let other = registry.allocate("abcd");
        assert_ne!(other, "abcd");

        assert_eq!(registry.resolve("abcd").as_deref(), Some("abcdef"));
        assert_eq!(registry.resolve(&other).as_deref(), Some("abcd"));
    }
}
