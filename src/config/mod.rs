//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! CLI flags (clap)
//!     → ProxyConfig / NodeConfig (all fields defaulted)
//!     → validate() (semantic checks, fatal at start-up)
//!     → shared via Arc to all subsystems
//! ```
//!
//! # Design Decisions
//! - Config is immutable once validated; the backend set is static for the
//!   lifetime of the process
//! - All fields have defaults so tests can build minimal configs
//! - Validation separates syntactic (clap/serde) from semantic checks

use serde::{Deserialize, Serialize};

/// Load-balancing strategy applied when a fingerprint has no usable
/// affinity binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    LeastConn,
    IpHash,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::RoundRobin
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastConn => "least_conn",
            Strategy::IpHash => "ip_hash",
        };
        f.write_str(s)
    }
}

/// Root configuration for the proxy role.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Strategy used when no affinity binding applies.
    pub strategy: Strategy,

    /// Static backend set, installed at start-up and never removed.
    pub backends: Vec<BackendEntry>,

    /// Health probe settings.
    pub health_check: HealthCheckConfig,

    /// Session affinity settings.
    pub affinity: AffinityConfig,

    /// Connect timeout for the backend leg of a splice, in seconds.
    pub connect_timeout_secs: u64,
}

impl ProxyConfig {
    /// Semantic validation; failures are fatal at start-up.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::BadBindAddress(self.bind_address.clone()));
        }
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        let mut seen = std::collections::HashSet::new();
        for b in &self.backends {
            if !seen.insert(b.id.as_str()) {
                return Err(ConfigError::DuplicateBackend(b.id.clone()));
            }
        }
        Ok(())
    }
}

/// One backend node, identified by an opaque id and its HTTP port.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendEntry {
    /// Unique backend identifier.
    pub id: String,

    /// Port of the backend's HTTP surface (upgrades live at `/ws`).
    pub http_port: u16,
}

/// Health probe configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable the active prober.
    pub enabled: bool,

    /// Probe interval in seconds.
    pub interval_secs: u64,

    /// Per-probe deadline in seconds.
    pub timeout_secs: u64,

    /// Path probed on each backend.
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            timeout_secs: 5,
            path: "/health".to_string(),
        }
    }
}

/// Session affinity configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AffinityConfig {
    /// Cookie carrying the fingerprint back to the client.
    pub cookie_name: String,

    /// Cookie Max-Age in seconds.
    pub cookie_max_age_secs: u64,

    /// Idle TTL for affinity entries, in seconds.
    pub ttl_secs: u64,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            cookie_name: "lb_session".to_string(),
            cookie_max_age_secs: 86_400,
            ttl_secs: 86_400,
        }
    }
}

/// Root configuration for the backend node role.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Bind address (e.g., "0.0.0.0:8081").
    pub bind_address: String,

    /// Opaque node identifier, reported in every API response.
    pub node_id: String,

    /// Path of the shared client registry file.
    pub registry_path: String,

    /// Registry sweep interval in seconds.
    pub sweep_interval_secs: u64,

    /// Records idle past this many seconds are evicted by the sweeper.
    pub evict_after_secs: u64,

    /// Records idle past this many seconds read as offline.
    pub offline_after_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8081".to_string(),
            node_id: "node1".to_string(),
            registry_path: "global_clients.json".to_string(),
            sweep_interval_secs: 60,
            evict_after_secs: 300,
            offline_after_secs: 30,
        }
    }
}

impl NodeConfig {
    /// Semantic validation; failures are fatal at start-up.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::BadBindAddress(self.bind_address.clone()));
        }
        if self.node_id.is_empty() {
            return Err(ConfigError::EmptyNodeId);
        }
        Ok(())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            strategy: Strategy::default(),
            backends: Vec::new(),
            health_check: HealthCheckConfig::default(),
            affinity: AffinityConfig::default(),
            connect_timeout_secs: 5,
        }
    }
}

/// Error type for configuration validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid bind address: {0}")]
    BadBindAddress(String),
    #[error("at least one backend is required")]
    NoBackends,
    #[error("duplicate backend id: {0}")]
    DuplicateBackend(String),
    #[error("node id must not be empty")]
    EmptyNodeId,
}
