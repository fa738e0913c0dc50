//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Deserializer, Serialize};

use crate::http::websocket::UpgradeMatch;
use crate::net::relay::RelayPolicy;

/// Root configuration for the reverse proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listen port and public domain.
    pub server: ServerConfig,

    /// The single backend origin all traffic is forwarded to.
    pub backend: BackendConfig,

    /// Certificate and key used for TLS termination.
    pub tls: TlsConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// WebSocket tunnel behaviour.
    pub tunnel: TunnelConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP port the TLS listener binds to.
    #[serde(deserialize_with = "port_from_number_or_string")]
    pub listen_port: u16,

    /// Externally visible domain. Informational only.
    pub domain: String,

    /// Interface to bind (e.g., "0.0.0.0").
    pub bind_address: String,
}

impl ServerConfig {
    /// The `host:port` string the listener binds to.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.listen_port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_port: 8443,
            domain: String::new(),
            bind_address: "0.0.0.0".to_string(),
        }
    }
}

/// Backend origin configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BackendConfig {
    /// Origin URL (e.g., "http://127.0.0.1:3000").
    pub url: String,
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: "server.crt".to_string(),
            key_path: "server.key".to_string(),
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Backend connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Time allowed for the backend to answer a WebSocket handshake.
    pub handshake_secs: u64,

    /// Time allowed for the backend to produce response headers. 0 disables.
    pub request_secs: u64,

    /// How long shutdown waits for open tunnels to finish.
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            handshake_secs: 10,
            request_secs: 60,
            shutdown_grace_secs: 10,
        }
    }
}

/// WebSocket tunnel configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TunnelConfig {
    /// What happens when one relay direction finishes.
    pub relay_policy: RelayPolicy,

    /// How upgrade requests are recognised.
    pub upgrade_match: UpgradeMatch,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Address for the Prometheus scrape endpoint. Disabled when unset.
    pub metrics_address: Option<String>,
}

fn port_from_number_or_string<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port: {:?}", text))),
    }
}
