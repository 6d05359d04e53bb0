//! Backend registry.
//!
//! # Responsibilities
//! - Hold the static set of backend descriptors
//! - Track health flags (prober) and live connection counts (splicer)
//! - Hand out value-copied snapshots for selection decisions
//!
//! # Design Decisions
//! - One RwLock around the map; snapshots keep the lock window short
//! - Connection accounting goes through an RAII guard so the decrement
//!   runs exactly once per splice

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

/// Mutable state of one backend, guarded by the registry lock.
#[derive(Debug)]
struct BackendState {
    http_base: String,
    ws_address: String,
    connections: u32,
    healthy: bool,
    last_check: SystemTime,
    weight: u32,
}

/// Immutable copy of one backend, as handed to selectors and admins.
#[derive(Debug, Clone)]
pub struct BackendSnapshot {
    pub id: String,
    pub http_base: String,
    pub ws_address: String,
    pub connections: u32,
    pub healthy: bool,
    pub weight: u32,
}

/// The set of backends behind the proxy.
///
/// Created at start-up from static configuration; descriptors are never
/// removed at runtime. Health is mutated only by the prober, connection
/// counts only by the splicer.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    inner: RwLock<HashMap<String, BackendState>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a backend descriptor, healthy with zero connections.
    /// Idempotent by id: a second add with the same id is a no-op.
    pub fn add(&self, id: &str, http_port: u16) {
        let mut inner = self.inner.write().expect("backend registry lock poisoned");
        if inner.contains_key(id) {
            return;
        }
        let http_base = format!("http://127.0.0.1:{http_port}");
        let ws_address = format!("ws://127.0.0.1:{http_port}/ws");
        tracing::info!(backend = %id, http = %http_base, ws = %ws_address, "Backend added");
        inner.insert(
            id.to_string(),
            BackendState {
                http_base,
                ws_address,
                connections: 0,
                healthy: true,
                last_check: SystemTime::now(),
                weight: 1,
            },
        );
    }

    /// Value-copied view of every backend, sorted by id so that equal
    /// inputs yield equal selection outputs across runs.
    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        let inner = self.inner.read().expect("backend registry lock poisoned");
        let mut backends: Vec<BackendSnapshot> = inner
            .iter()
            .map(|(id, state)| BackendSnapshot {
                id: id.clone(),
                http_base: state.http_base.clone(),
                ws_address: state.ws_address.clone(),
                connections: state.connections,
                healthy: state.healthy,
                weight: state.weight,
            })
            .collect();
        backends.sort_by(|a, b| a.id.cmp(&b.id));
        backends
    }

    /// Flip a backend's health flag. Transitions are logged on the edge;
    /// `last_check` is refreshed on every call.
    pub fn mark_healthy(&self, id: &str, healthy: bool) {
        let mut inner = self.inner.write().expect("backend registry lock poisoned");
        if let Some(state) = inner.get_mut(id) {
            if state.healthy && !healthy {
                tracing::warn!(backend = %id, address = %state.http_base, "Backend became unhealthy");
            } else if !state.healthy && healthy {
                tracing::info!(backend = %id, address = %state.http_base, "Backend recovered");
            }
            state.healthy = healthy;
            state.last_check = SystemTime::now();
        }
    }

    /// Adjust a backend's live connection count. The count never goes
    /// below zero; an underflow indicates a double decrement.
    pub fn adjust_connections(&self, id: &str, delta: i32) {
        let mut inner = self.inner.write().expect("backend registry lock poisoned");
        if let Some(state) = inner.get_mut(id) {
            if delta >= 0 {
                state.connections = state.connections.saturating_add(delta as u32);
            } else {
                let dec = delta.unsigned_abs();
                debug_assert!(state.connections >= dec, "connection count underflow");
                state.connections = state.connections.saturating_sub(dec);
            }
        }
    }

    /// Current connection count for one backend.
    pub fn connections(&self, id: &str) -> Option<u32> {
        let inner = self.inner.read().expect("backend registry lock poisoned");
        inner.get(id).map(|state| state.connections)
    }

    pub fn contains(&self, id: &str) -> bool {
        let inner = self.inner.read().expect("backend registry lock poisoned");
        inner.contains_key(id)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().expect("backend registry lock poisoned");
        inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Timestamp of the last probe touching this backend.
    pub fn last_check(&self, id: &str) -> Option<SystemTime> {
        let inner = self.inner.read().expect("backend registry lock poisoned");
        inner.get(id).map(|state| state.last_check)
    }
}

/// RAII guard for one splice's slot in the connection count.
///
/// Incremented on creation, decremented exactly once on drop, which ties
/// the count to the splice's lifetime regardless of which leg fails first.
#[derive(Debug)]
pub struct ConnectionGuard {
    registry: Arc<BackendRegistry>,
    backend_id: String,
}

impl ConnectionGuard {
    pub fn acquire(registry: Arc<BackendRegistry>, backend_id: &str) -> Self {
        registry.adjust_connections(backend_id, 1);
        Self {
            registry,
            backend_id: backend_id.to_string(),
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.adjust_connections(&self.backend_id, -1);
    }
}
