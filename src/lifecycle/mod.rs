//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     Parse CLI → Validate config → Initialize subsystems → Serve
//!
//! Shutdown (shutdown.rs):
//!     Ctrl-C or trigger() → listeners stop accepting → per-leg EOF drains
//!     forwarders → background tasks observe the broadcast and exit
//! ```
//!
//! # Design Decisions
//! - No global cancellation token beyond process shutdown; in-flight
//!   splices drain naturally on EOF
//! - Background tasks (prober, sweepers) each hold one receiver

pub mod shutdown;

pub use shutdown::Shutdown;
