//! TLS-terminating reverse proxy with transparent WebSocket tunnelling.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;

pub use config::{BackendTarget, ProxyConfig};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
