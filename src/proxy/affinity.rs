//! Session-affinity table.
//!
//! # Responsibilities
//! - Map client fingerprints to backend ids
//! - Treat entries bound to unhealthy or unknown backends as misses
//! - Expire idle entries on a periodic sweep
//!
//! # Design Decisions
//! - One mutex, never held across I/O; sweeping shares it with selection
//!   so the two cannot race
//! - Sticky-until-unhealthy: a stale entry is dropped on observation and
//!   the fingerprint re-binds on the next selection

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::proxy::registry::BackendSnapshot;

#[derive(Debug)]
struct AffinityEntry {
    backend_id: String,
    created_at: Instant,
    last_seen: Instant,
}

/// Fingerprint → backend binding with idle TTL.
#[derive(Debug, Default)]
pub struct AffinityTable {
    entries: Mutex<HashMap<String, AffinityEntry>>,
}

impl AffinityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the bound backend id if the binding points at a backend that
    /// is present in the snapshot and currently healthy. A stale binding
    /// is removed and reported as a miss. Health is only consulted, never
    /// written.
    pub fn lookup(&self, fingerprint: &str, snapshot: &[BackendSnapshot]) -> Option<String> {
        let mut entries = self.entries.lock().expect("affinity table lock poisoned");
        let entry = entries.get_mut(fingerprint)?;
        let alive = snapshot
            .iter()
            .any(|b| b.id == entry.backend_id && b.healthy);
        if alive {
            entry.last_seen = Instant::now();
            Some(entry.backend_id.clone())
        } else {
            let stale = entries.remove(fingerprint);
            if let Some(stale) = stale {
                tracing::debug!(
                    fingerprint = %fingerprint,
                    backend = %stale.backend_id,
                    "Dropped stale affinity entry"
                );
            }
            None
        }
    }

    /// Install or refresh a binding with the current timestamp.
    pub fn bind(&self, fingerprint: &str, backend_id: &str) {
        let mut entries = self.entries.lock().expect("affinity table lock poisoned");
        let now = Instant::now();
        entries
            .entry(fingerprint.to_string())
            .and_modify(|entry| {
                entry.backend_id = backend_id.to_string();
                entry.last_seen = now;
            })
            .or_insert_with(|| AffinityEntry {
                backend_id: backend_id.to_string(),
                created_at: now,
                last_seen: now,
            });
    }

    /// Drop entries idle past `ttl`. Returns how many were evicted.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let mut entries = self.entries.lock().expect("affinity table lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| entry.last_seen.elapsed() <= ttl);
        let evicted = before - entries.len();
        if evicted > 0 {
            tracing::debug!(evicted, "Affinity sweep");
        }
        evicted
    }

    /// Age of a binding since it was first installed.
    pub fn bound_for(&self, fingerprint: &str) -> Option<Duration> {
        let entries = self.entries.lock().expect("affinity table lock poisoned");
        entries.get(fingerprint).map(|e| e.created_at.elapsed())
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().expect("affinity table lock poisoned");
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(entries: &[(&str, bool)]) -> Vec<BackendSnapshot> {
        entries
            .iter()
            .map(|(id, healthy)| BackendSnapshot {
                id: id.to_string(),
                http_base: "http://127.0.0.1:0".to_string(),
                ws_address: "ws://127.0.0.1:0/ws".to_string(),
                connections: 0,
                healthy: *healthy,
                weight: 1,
            })
            .collect()
    }

    #[test]
    fn lookup_hits_healthy_binding() {
        let table = AffinityTable::new();
        table.bind("fp-1", "node1");
        let snap = snapshot(&[("node1", true), ("node2", true)]);
        assert_eq!(table.lookup("fp-1", &snap), Some("node1".to_string()));
        assert_eq!(table.lookup("fp-1", &snap), Some("node1".to_string()));
    }

    #[test]
    fn unhealthy_binding_is_a_miss_and_removed() {
        let table = AffinityTable::new();
        table.bind("fp-1", "node1");
        let snap = snapshot(&[("node1", false), ("node2", true)]);
        assert_eq!(table.lookup("fp-1", &snap), None);
        assert!(table.is_empty(), "stale entry should be dropped");
    }

    #[test]
    fn unknown_backend_is_a_miss() {
        let table = AffinityTable::new();
        table.bind("fp-1", "gone");
        let snap = snapshot(&[("node1", true)]);
        assert_eq!(table.lookup("fp-1", &snap), None);
    }

    #[test]
    fn rebind_overwrites() {
        let table = AffinityTable::new();
        table.bind("fp-1", "node1");
        table.bind("fp-1", "node2");
        let snap = snapshot(&[("node1", true), ("node2", true)]);
        assert_eq!(table.lookup("fp-1", &snap), Some("node2".to_string()));
        assert_eq!(table.len(), 1);
        assert!(table.bound_for("fp-1").is_some());
        assert!(table.bound_for("fp-9").is_none());
    }

    #[test]
    fn sweep_evicts_idle_entries() {
        let table = AffinityTable::new();
        table.bind("fp-1", "node1");
        assert_eq!(table.sweep(Duration::from_secs(60)), 0);
        assert_eq!(table.sweep(Duration::ZERO), 1);
        assert!(table.is_empty());
    }
}
