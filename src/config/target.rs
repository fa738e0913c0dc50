//! The backend origin every request is forwarded to.
//!
//! Resolved once at startup from `backend.url` and shared read-only (via
//! `Arc`) with every handler.

use std::fmt;

use thiserror::Error;
use url::Url;

/// Error raised when the configured backend origin cannot be used.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("invalid backend url {url:?}: {source}")]
    Parse {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported backend scheme {0:?} (expected http or ws)")]
    Scheme(String),
    #[error("backend url {0:?} has no host")]
    MissingHost(String),
}

/// An immutable backend origin (scheme, host, port) plus optional base path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    host: String,
    port: u16,
    base_path: String,
    base_query: Option<String>,
}

impl BackendTarget {
    /// Parse and validate a backend origin URL.
    ///
    /// `ws://` is accepted as an alias for `http://` since the tunnel speaks
    /// plain TCP to the backend either way.
    pub fn parse(raw: &str) -> Result<Self, TargetError> {
        let url = Url::parse(raw).map_err(|source| TargetError::Parse {
            url: raw.to_string(),
            source,
        })?;

        match url.scheme() {
            "http" | "ws" => {}
            other => return Err(TargetError::Scheme(other.to_string())),
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TargetError::MissingHost(raw.to_string()))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);

        let base_path = match url.path() {
            "/" => String::new(),
            path => path.to_string(),
        };

        Ok(Self {
            host,
            port,
            base_path,
            base_query: url.query().map(str::to_string),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, suitable for a TCP dial. IPv6 hosts keep their brackets.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Value for the `Host` header of forwarded requests.
    pub fn authority(&self) -> String {
        if self.port == 80 {
            self.host.clone()
        } else {
            self.socket_addr()
        }
    }

    /// Rewrite an inbound path and query onto this target.
    ///
    /// The target's base path is joined to the request path with exactly one
    /// slash between them, and the target's query (if any) comes first.
    pub fn rewrite_path_and_query(&self, path: &str, query: Option<&str>) -> String {
        let mut out = join_paths(&self.base_path, path);
        let query = match (self.base_query.as_deref(), query) {
            (Some(base), Some(q)) if !base.is_empty() && !q.is_empty() => {
                Some(format!("{}&{}", base, q))
            }
            (Some(base), _) if !base.is_empty() => Some(base.to_string()),
            (_, Some(q)) if !q.is_empty() => Some(q.to_string()),
            _ => None,
        };
        if let Some(q) = query {
            out.push('?');
            out.push_str(&q);
        }
        out
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}{}", self.authority(), self.base_path)
    }
}

fn join_paths(base: &str, path: &str) -> String {
    if base.is_empty() {
        return if path.is_empty() { "/".to_string() } else { path.to_string() };
    }
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}
