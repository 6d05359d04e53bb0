//! Backend session plane: the per-node server the proxy fronts.
//!
//! # Data Flow
//! ```text
//! /ws upgrade → session.rs
//!     → registration envelope (first frame)
//!     → local table + shared registry entry
//!     → message loop (command responses, generic request/response)
//!     → ordered teardown (local remove, registry unregister)
//!
//! HTTP surface → server.rs
//!     /health, /api/clients, /api/global-clients, /api/query,
//!     /api/node-info, /api/send-command (local deliver or one-hop
//!     forward to the owning node)
//!
//! registry.rs: file-backed shared client registry + periodic sweeper
//! ```

pub mod registry;
pub mod server;
pub mod session;
