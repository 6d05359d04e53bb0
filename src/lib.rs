//! WebSocket-aware layer-7 reverse proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌───────────────────────────────────────────────┐
//!                    │                    PROXY                      │
//!   Client Request   │  ┌──────────┐   ┌──────────┐   ┌───────────┐ │
//!   ─────────────────┼─▶│  front   │──▶│ selector │──▶│ registry  │ │
//!                    │  │  door    │   │ +affinity│   │ snapshot  │ │
//!                    │  └────┬─────┘   └──────────┘   └───────────┘ │
//!                    │       │                                      │
//!                    │       ├─ upgrade ──▶ splicer (two legs)      │
//!                    │       └─ other ────▶ reverse proxy           │
//!                    └──────────────────────┬────────────────────────┘
//!                                           ▼
//!                    ┌───────────────────────────────────────────────┐
//!                    │              BACKEND NODE (xN)                │
//!                    │  /ws session plane · HTTP API · shared client │
//!                    │  registry (file-backed) · command dispatch    │
//!                    └───────────────────────────────────────────────┘
//! ```
//!
//! Background tasks: a health prober flips registry health flags on probe
//! edges, an affinity sweeper expires idle fingerprints, and each backend
//! node runs a registry sweeper that evicts stale client records.

// Core subsystems
pub mod config;
pub mod protocol;
pub mod proxy;

// Backend session plane
pub mod node;

// Cross-cutting concerns
pub mod lifecycle;

pub use config::{NodeConfig, ProxyConfig};
pub use lifecycle::Shutdown;
pub use node::server::NodeServer;
pub use proxy::server::ProxyServer;
