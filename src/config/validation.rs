//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check the backend origin is usable for both forwarding and tunnelling
//! - Validate value ranges (timeouts > 0, ports valid)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::ProxyConfig;
use crate::config::target::BackendTarget;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field (e.g., "backend.url").
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.listen_port == 0 {
        errors.push(ValidationError::new("server.listen_port", "must be between 1 and 65535"));
    }
    if config.server.bind_address.trim().is_empty() {
        errors.push(ValidationError::new("server.bind_address", "must not be empty"));
    }

    if config.backend.url.trim().is_empty() {
        errors.push(ValidationError::new("backend.url", "is required"));
    } else if let Err(e) = BackendTarget::parse(&config.backend.url) {
        errors.push(ValidationError::new("backend.url", e.to_string()));
    }

    if config.tls.cert_path.is_empty() {
        errors.push(ValidationError::new("tls.cert_path", "must not be empty"));
    }
    if config.tls.key_path.is_empty() {
        errors.push(ValidationError::new("tls.key_path", "must not be empty"));
    }

    if config.timeouts.connect_secs == 0 {
        errors.push(ValidationError::new("timeouts.connect_secs", "must be greater than 0"));
    }
    if config.timeouts.handshake_secs == 0 {
        errors.push(ValidationError::new("timeouts.handshake_secs", "must be greater than 0"));
    }

    if let Some(addr) = &config.observability.metrics_address {
        if addr.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new(
                "observability.metrics_address",
                format!("{:?} is not a socket address", addr),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.backend.url = "http://127.0.0.1:3000".into();
        config
    }

    #[test]
    fn accepts_minimal_config() {
        assert!(validate_config(&valid()).is_ok());
    }

    #[test]
    fn missing_backend_is_reported() {
        let errors = validate_config(&ProxyConfig::default()).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "backend.url");
    }

    #[test]
    fn collects_every_error() {
        let mut config = valid();
        config.server.listen_port = 0;
        config.backend.url = "https://secure.example".into();
        config.timeouts.connect_secs = 0;
        config.observability.metrics_address = Some("nowhere".into());

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "server.listen_port",
                "backend.url",
                "timeouts.connect_secs",
                "observability.metrics_address",
            ]
        );
    }
}
