//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TLS connection
//!     → server.rs (Axum setup, request ID, dispatch)
//!     → websocket.rs (upgrade detector)
//!         ├─ upgrade → websocket.rs (tunnel) → handshake.rs → net::relay
//!         └─ other   → forward.rs (single-target forwarder)
//!     → response.rs (error responses, hop-by-hop stripping)
//!     → Send to client
//! ```

pub mod forward;
pub mod handshake;
pub mod request;
pub mod response;
pub mod server;
pub mod websocket;

pub use forward::{DefaultErrorHandler, ErrorHandler, ForwardError, Forwarder};
pub use request::{request_id, X_REQUEST_ID};
pub use server::{HttpServer, ServerError};
pub use websocket::{is_websocket_upgrade, TunnelError, UpgradeMatch};
