//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to backend:
//!     → timeouts.rs (enforce connect/handshake/response-head deadlines)
//!     → On failure: single-shot error response, never retried
//! ```

pub mod timeouts;

pub use timeouts::{with_timeout, Elapsed};
