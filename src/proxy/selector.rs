//! Backend selection.
//!
//! # Algorithm
//! 1. Affinity lookup; a hit short-circuits the strategy entirely.
//! 2. Filter the snapshot for healthy backends; none → no decision.
//! 3. Apply the configured strategy over the (sorted) filtered list.
//! 4. Bind the fingerprint to the winner.
//!
//! # Design Decisions
//! - The round-robin cursor is proxy-global and advances after the
//!   decision, so first connects from distinct clients fan out in order
//! - Snapshots arrive sorted by id, making least_conn ties and ip_hash
//!   deterministic across runs

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::Strategy;
use crate::proxy::affinity::AffinityTable;
use crate::proxy::fingerprint;
use crate::proxy::registry::BackendSnapshot;

/// Decides which backend receives a request.
#[derive(Debug)]
pub struct Selector {
    strategy: Strategy,
    affinity: AffinityTable,
    round_robin_idx: AtomicUsize,
}

impl Selector {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            affinity: AffinityTable::new(),
            round_robin_idx: AtomicUsize::new(0),
        }
    }

    pub fn affinity(&self) -> &AffinityTable {
        &self.affinity
    }

    /// Pick one healthy backend for `fingerprint`, or `None` when every
    /// backend is unhealthy. The winning backend is bound to the
    /// fingerprint before returning.
    pub fn select(
        &self,
        fingerprint: &str,
        snapshot: &[BackendSnapshot],
    ) -> Option<BackendSnapshot> {
        if let Some(bound) = self.affinity.lookup(fingerprint, snapshot) {
            return snapshot.iter().find(|b| b.id == bound).cloned();
        }

        let healthy: Vec<&BackendSnapshot> = snapshot.iter().filter(|b| b.healthy).collect();
        if healthy.is_empty() {
            return None;
        }

        let chosen = match self.strategy {
            Strategy::RoundRobin => {
                let idx = self.round_robin_idx.fetch_add(1, Ordering::SeqCst);
                healthy[idx % healthy.len()]
            }
            Strategy::LeastConn => healthy
                .iter()
                .min_by_key(|b| b.connections)
                .copied()
                .expect("filtered list is non-empty"),
            Strategy::IpHash => {
                let idx = fingerprint::hash_byte(fingerprint) as usize % healthy.len();
                healthy[idx]
            }
        };

        self.affinity.bind(fingerprint, &chosen.id);
        Some(chosen.clone())
    }
}
