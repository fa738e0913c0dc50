//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → tls.rs (TLS handshake via axum-server/rustls)
//!     → Hand off to HTTP layer
//!
//! WebSocket upgrade:
//!     connection.rs (Serving → Hijacked → Closed)
//!     → relay.rs (full-duplex byte copy until either side closes)
//! ```
//!
//! # Design Decisions
//! - A client connection has exactly one owner at a time
//! - Each tunnel owns a private pair of connections; nothing is pooled
//! - Relay teardown policy is explicit configuration

pub mod connection;
pub mod relay;
pub mod tls;

pub use connection::{TunnelGuard, TunnelId, TunnelState, TunnelTracker};
pub use relay::{relay, RelayPolicy, RelayStats};
