//! Cooldown-bounded retry gating for reconciliation traffic.
//!
//! The reconciler re-sends creation intents until the server's snapshot shows
//! the entity materialized. Resends are bounded by a per-key cooldown, not by
//! an attempt count: each `(entity kind, ident)` pair may fire at most once
//! per TTL window. Clocks are injected as millisecond values so the gate is
//! fully deterministic under test.

use std::collections::HashMap;

/// What kind of pending work a gate key throttles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Re-sending `create_group` for an unmatched temp group.
    Group,
    /// Re-sending `create_volume` for a missing desired volume title.
    Volume,
    /// Re-sending `create_entry_with_content` for an unmaterialized entry.
    Entry,
    /// Re-issuing `reorder_volumes` once a temp group's volumes all exist.
    VolumeOrder,
    /// Deleting a server-created volume the client never asked for.
    VolumeCleanup,
}

/// Cooldown between attempts for the same key.
pub const DEFAULT_COOLDOWN_MS: u64 = 1500;

/// Tracks the last attempt time per `(kind, ident)` key.
#[derive(Debug)]
pub struct RetryGate {
    ttl_ms: u64,
    attempts: HashMap<(EntityKind, String), u64>,
}

impl Default for RetryGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryGate {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_COOLDOWN_MS)
    }

    pub fn with_ttl(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            attempts: HashMap::new(),
        }
    }

    /// Returns true at most once per TTL window for the given key, recording
    /// the attempt when it does. Callers only send when this returns true.
    pub fn should_attempt(&mut self, kind: EntityKind, ident: &str, now_ms: u64) -> bool {
        let key = (kind, ident.to_string());
        if let Some(last) = self.attempts.get(&key) {
            if now_ms.saturating_sub(*last) < self.ttl_ms {
                return false;
            }
        }
        self.attempts.insert(key, now_ms);
        true
    }

    /// Drop a key once its purpose is fulfilled (entity materialized).
    pub fn forget(&mut self, kind: EntityKind, ident: &str) {
        self.attempts.remove(&(kind, ident.to_string()));
    }

    /// Remove expired records so the map cannot grow without bound.
    pub fn prune(&mut self, now_ms: u64) {
        let ttl = self.ttl_ms;
        self.attempts
            .retain(|_, last| now_ms.saturating_sub(*last) < ttl);
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.attempts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_is_allowed() {
        let mut gate = RetryGate::new();
        assert!(gate.should_attempt(EntityKind::Group, "temp-group-1", 0));
    }

    #[test]
    fn test_attempt_within_cooldown_is_blocked() {
        let mut gate = RetryGate::new();
        assert!(gate.should_attempt(EntityKind::Group, "temp-group-1", 0));
        assert!(!gate.should_attempt(EntityKind::Group, "temp-group-1", 1499));
        assert!(gate.should_attempt(EntityKind::Group, "temp-group-1", 1500));
    }

    #[test]
    fn test_keys_are_independent() {
        let mut gate = RetryGate::new();
        assert!(gate.should_attempt(EntityKind::Entry, "a", 0));
        assert!(gate.should_attempt(EntityKind::Entry, "b", 10));
        // Same ident under a different kind is a different key.
        assert!(gate.should_attempt(EntityKind::Volume, "a", 20));
        assert!(!gate.should_attempt(EntityKind::Entry, "a", 100));
    }

    #[test]
    fn test_forget_reopens_the_gate() {
        let mut gate = RetryGate::new();
        assert!(gate.should_attempt(EntityKind::Entry, "k", 0));
        gate.forget(EntityKind::Entry, "k");
        assert!(gate.should_attempt(EntityKind::Entry, "k", 1));
    }

    #[test]
    fn test_prune_drops_only_expired_records() {
        let mut gate = RetryGate::with_ttl(100);
        gate.should_attempt(EntityKind::Group, "old", 0);
        gate.should_attempt(EntityKind::Group, "new", 950);
        gate.prune(1000);
        assert_eq!(gate.pending(), 1);
        assert!(!gate.should_attempt(EntityKind::Group, "new", 1000));
        assert!(gate.should_attempt(EntityKind::Group, "old", 1000));
    }
}
