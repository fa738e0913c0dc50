//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (YAML/TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → target.rs (backend origin resolved once)
//!     → shared via Arc to every request handler
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; there is no hot reload
//! - All fields except the backend URL have defaults
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod target;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    BackendConfig, ObservabilityConfig, ProxyConfig, ServerConfig, TimeoutConfig, TlsConfig,
    TunnelConfig,
};
pub use target::{BackendTarget, TargetError};
