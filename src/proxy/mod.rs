//! Proxy subsystem: front-end admission, backend selection and duplex
//! splicing.
//!
//! # Data Flow
//! ```text
//! Request arrives → fingerprint.rs (cookie or hashed identity)
//!     → selector.rs (affinity first, strategy second)
//!         → registry.rs (healthy snapshot, connection counts)
//!     → upgrade?  splice.rs (two forwarders, exactly-once accounting)
//!     → otherwise server.rs reverse-proxies to the backend HTTP base
//!
//! Background: prober.rs ticks and flips health flags;
//!             the affinity sweeper expires idle fingerprints.
//! ```
//!
//! # Design Decisions
//! - Selection works on value-copied snapshots; registry locks are never
//!   held across I/O
//! - Affinity is sticky-until-unhealthy, never sticky-to-dead
//! - The splicer is frame-transparent and never retries

pub mod affinity;
pub mod fingerprint;
pub mod prober;
pub mod registry;
pub mod selector;
pub mod server;
pub mod splice;
