//! Shared client registry.
//!
//! # Responsibilities
//! - Process-wide record of live clients, keyed by client id
//! - Cross-process visibility among colocated nodes via a JSON file,
//!   rewritten whole on each mutation (small-N assumption)
//! - Periodic eviction of records that stopped refreshing
//!
//! # Design Decisions
//! - One mutex guards the map and the file write together
//! - Reads report a record as offline once it goes quiet, without
//!   deleting it; deletion is the sweeper's job
//! - Last-seen only ever moves forward

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::protocol::timestamp_ms;

/// Client presence as reported to admins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Online,
    Offline,
    Busy,
}

/// One client's registry record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: String,
    pub name: String,
    pub node_id: String,
    pub node_port: u16,
    /// Milliseconds since the Unix epoch.
    pub conn_time: i64,
    /// Milliseconds since the Unix epoch.
    pub last_seen: i64,
    pub is_active: bool,
    pub status: ClientStatus,
}

/// File-backed map of live clients.
pub struct ClientRegistry {
    path: PathBuf,
    offline_after: Duration,
    inner: Mutex<HashMap<String, ClientRecord>>,
}

impl ClientRegistry {
    /// Open the registry at `path`, loading any existing records. A
    /// missing or unreadable file starts the registry empty.
    pub fn open(path: impl AsRef<Path>, offline_after: Duration) -> Self {
        let path = path.as_ref().to_path_buf();
        let records = match std::fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<HashMap<String, ClientRecord>>(&data) {
                Ok(records) => {
                    tracing::info!(path = %path.display(), count = records.len(), "Loaded client registry");
                    records
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Unparseable registry file, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            offline_after,
            inner: Mutex::new(records),
        }
    }

    /// Register a freshly connected client.
    pub fn register(&self, id: &str, name: &str, node_id: &str, node_port: u16) {
        let now = timestamp_ms();
        let mut inner = self.inner.lock().expect("client registry lock poisoned");
        inner.insert(
            id.to_string(),
            ClientRecord {
                id: id.to_string(),
                name: name.to_string(),
                node_id: node_id.to_string(),
                node_port,
                conn_time: now,
                last_seen: now,
                is_active: true,
                status: ClientStatus::Online,
            },
        );
        self.persist(&inner);
        tracing::info!(client_id = %id, client_name = %name, node = %node_id, "Client registered");
    }

    /// Remove a client's record when its leg closes.
    pub fn unregister(&self, id: &str) {
        let mut inner = self.inner.lock().expect("client registry lock poisoned");
        if let Some(record) = inner.remove(id) {
            self.persist(&inner);
            tracing::info!(client_id = %id, client_name = %record.name, "Client unregistered");
        }
    }

    /// Refresh a client's last-seen time. Last-seen never decreases.
    pub fn update_activity(&self, id: &str) {
        let now = timestamp_ms();
        let mut inner = self.inner.lock().expect("client registry lock poisoned");
        if let Some(record) = inner.get_mut(id) {
            record.last_seen = record.last_seen.max(now);
            record.is_active = true;
            record.status = ClientStatus::Online;
            self.persist(&inner);
        }
    }

    /// Set a client's status, refreshing last-seen.
    pub fn set_status(&self, id: &str, status: ClientStatus) {
        let now = timestamp_ms();
        let mut inner = self.inner.lock().expect("client registry lock poisoned");
        if let Some(record) = inner.get_mut(id) {
            record.status = status;
            record.last_seen = record.last_seen.max(now);
            self.persist(&inner);
        }
    }

    /// All records, with the offline read-rule applied to the copies.
    pub fn get_all(&self) -> Vec<ClientRecord> {
        let inner = self.inner.lock().expect("client registry lock poisoned");
        let mut records: Vec<ClientRecord> =
            inner.values().map(|r| self.with_read_rule(r)).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// One record, with the offline read-rule applied.
    pub fn get(&self, id: &str) -> Option<ClientRecord> {
        let inner = self.inner.lock().expect("client registry lock poisoned");
        inner.get(id).map(|r| self.with_read_rule(r))
    }

    /// Evict records idle past `evict_after`. Returns how many were
    /// dropped.
    pub fn sweep(&self, evict_after: Duration) -> usize {
        let cutoff = timestamp_ms() - evict_after.as_millis() as i64;
        let mut inner = self.inner.lock().expect("client registry lock poisoned");
        let before = inner.len();
        inner.retain(|_, record| record.last_seen >= cutoff);
        let evicted = before - inner.len();
        if evicted > 0 {
            self.persist(&inner);
            tracing::info!(evicted, "Swept stale client records");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("client registry lock poisoned");
        inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A record that stopped refreshing reads as offline without being
    /// deleted.
    fn with_read_rule(&self, record: &ClientRecord) -> ClientRecord {
        let mut copy = record.clone();
        let idle_ms = timestamp_ms() - copy.last_seen;
        if idle_ms > self.offline_after.as_millis() as i64 {
            copy.is_active = false;
            copy.status = ClientStatus::Offline;
        } else {
            copy.is_active = true;
            if copy.status == ClientStatus::Offline {
                copy.status = ClientStatus::Online;
            }
        }
        copy
    }

    /// Rewrite the whole file; called with the map lock held.
    fn persist(&self, records: &HashMap<String, ClientRecord>) {
        match serde_json::to_string_pretty(records) {
            Ok(data) => {
                if let Err(e) = std::fs::write(&self.path, data) {
                    tracing::warn!(path = %self.path.display(), error = %e, "Registry write failed");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Registry serialization failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "wsgate-registry-{tag}-{}.json",
            uuid::Uuid::new_v4().simple()
        ))
    }

    #[test]
    fn register_and_get_all() {
        let path = scratch_path("basic");
        let registry = ClientRegistry::open(&path, Duration::from_secs(30));
        registry.register("c1", "alice", "node1", 8081);
        registry.register("c2", "bob", "node2", 8082);

        let all = registry.get_all();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|r| r.is_active && r.status == ClientStatus::Online));

        registry.unregister("c1");
        assert_eq!(registry.get_all().len(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn records_survive_reopen() {
        let path = scratch_path("reload");
        {
            let registry = ClientRegistry::open(&path, Duration::from_secs(30));
            registry.register("c1", "alice", "node1", 8081);
        }
        let reopened = ClientRegistry::open(&path, Duration::from_secs(30));
        let record = reopened.get("c1").expect("record should persist");
        assert_eq!(record.name, "alice");
        assert_eq!(record.node_port, 8081);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn quiet_records_read_as_offline_without_deletion() {
        let path = scratch_path("offline");
        let registry = ClientRegistry::open(&path, Duration::ZERO);
        registry.register("c1", "alice", "node1", 8081);
        std::thread::sleep(Duration::from_millis(5));

        let record = registry.get("c1").expect("record still present");
        assert!(!record.is_active);
        assert_eq!(record.status, ClientStatus::Offline);
        assert_eq!(registry.len(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn sweep_evicts_idle_records() {
        let path = scratch_path("sweep");
        let registry = ClientRegistry::open(&path, Duration::from_secs(30));
        registry.register("c1", "alice", "node1", 8081);

        assert_eq!(registry.sweep(Duration::from_secs(300)), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.sweep(Duration::ZERO), 1);
        assert!(registry.get_all().is_empty());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn last_seen_is_monotonic() {
        let path = scratch_path("monotonic");
        let registry = ClientRegistry::open(&path, Duration::from_secs(30));
        registry.register("c1", "alice", "node1", 8081);
        let first = registry.get("c1").unwrap().last_seen;

        registry.update_activity("c1");
        registry.set_status("c1", ClientStatus::Busy);
        let after = registry.get("c1").unwrap();
        assert!(after.last_seen >= first);
        assert_eq!(after.status, ClientStatus::Busy);
        let _ = std::fs::remove_file(path);
    }
}
