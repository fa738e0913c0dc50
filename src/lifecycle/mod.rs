//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Resolve backend → Start TLS listener
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain connections and tunnels → Exit
//! ```
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Shutdown has a grace period: open tunnels are cut after the deadline

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
