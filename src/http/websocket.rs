//! WebSocket upgrade detection and tunnelling.
//!
//! # Responsibilities
//! - Classify inbound requests as WebSocket upgrades
//! - Dial the backend and replay the upgrade handshake to it
//! - Take over (hijack) the client connection once the backend agrees
//! - Hand both raw connections to the duplex relay
//!
//! # Data Flow
//! ```text
//! Client ── upgrade request ──▶ Proxy ── dial + replayed handshake ──▶ Backend
//! Client ◀── backend's 101 ──── Proxy ◀──────── 101 ─────────────────── Backend
//! Client ◀═══════════ raw bytes (net::relay) ═══════════════════════▶ Backend
//! ```
//!
//! # Design Decisions
//! - No WebSocket framing is parsed; after the 101 the tunnel is opaque bytes
//! - Every failure before the 101 is a single synchronous error response
//! - The backend connection is dropped on every failure path

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::Instrument;

use crate::config::{BackendTarget, ProxyConfig};
use crate::http::handshake::{self, HandshakeError};
use crate::http::request::request_id;
use crate::http::response::error_response;
use crate::net::{relay, RelayPolicy, TunnelGuard, TunnelTracker};
use crate::resilience::{with_timeout, Elapsed};

/// How strictly upgrade requests are recognised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeMatch {
    /// `Upgrade: websocket` and `Connection: Upgrade`, byte for byte.
    #[default]
    Strict,
    /// Case-insensitive values, comma-separated `Connection` tokens.
    Lenient,
}

impl UpgradeMatch {
    pub fn matches(self, headers: &HeaderMap) -> bool {
        match self {
            UpgradeMatch::Strict => is_websocket_upgrade(headers),
            UpgradeMatch::Lenient => is_websocket_upgrade_lenient(headers),
        }
    }
}

/// True iff `Upgrade` is exactly `websocket` and `Connection` is exactly
/// `Upgrade`. Only the first value of each header is considered.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers.get(header::UPGRADE).map(|v| v.as_bytes());
    let connection = headers.get(header::CONNECTION).map(|v| v.as_bytes());
    upgrade == Some(b"websocket".as_slice()) && connection == Some(b"Upgrade".as_slice())
}

fn is_websocket_upgrade_lenient(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get_all(header::UPGRADE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("websocket"));
    let connection = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    upgrade && connection
}

/// Reasons a tunnel could not be established.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to connect to backend {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Timeout(#[from] Elapsed),
    #[error("client connection does not support hijacking")]
    HijackUnsupported,
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("failed to hijack client connection: {0}")]
    Hijack(#[source] hyper::Error),
}

impl TunnelError {
    /// Status sent to the client for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            TunnelError::Dial { .. } | TunnelError::Timeout(_) | TunnelError::Handshake(_) => {
                StatusCode::BAD_GATEWAY
            }
            TunnelError::HijackUnsupported | TunnelError::Hijack(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            TunnelError::Dial { .. } => "dial",
            TunnelError::Timeout(_) => "timeout",
            TunnelError::HijackUnsupported => "hijack_unsupported",
            TunnelError::Handshake(_) => "handshake",
            TunnelError::Hijack(_) => "hijack",
        }
    }

    fn client_message(&self) -> &'static str {
        match self {
            TunnelError::Dial { .. } | TunnelError::Timeout(_) => "WebSocket connection failed",
            TunnelError::HijackUnsupported => "WebSocket handling failed",
            TunnelError::Handshake(_) | TunnelError::Hijack(_) => "WebSocket handshake failed",
        }
    }
}

impl IntoResponse for TunnelError {
    fn into_response(self) -> Response {
        error_response(self.status(), self.client_message())
    }
}

/// Tunnel tuning taken from configuration.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub relay_policy: RelayPolicy,
}

impl From<&ProxyConfig> for TunnelSettings {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.timeouts.connect_secs),
            handshake_timeout: Duration::from_secs(config.timeouts.handshake_secs),
            relay_policy: config.tunnel.relay_policy,
        }
    }
}

/// Establishes WebSocket tunnels to the backend target.
#[derive(Clone)]
pub struct TunnelEstablisher {
    target: Arc<BackendTarget>,
    settings: TunnelSettings,
    tracker: TunnelTracker,
}

impl TunnelEstablisher {
    pub fn new(target: Arc<BackendTarget>, settings: TunnelSettings, tracker: TunnelTracker) -> Self {
        Self {
            target,
            settings,
            tracker,
        }
    }

    /// Handle an upgrade request, turning any failure into its error response.
    pub async fn handle(&self, request: Request<Body>) -> Response {
        let request_id = request_id(request.headers()).to_string();
        let path = request.uri().path().to_string();

        match self.establish(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    request_id = %request_id,
                    path = %path,
                    backend = %self.target,
                    error = %e,
                    "WebSocket tunnel not established"
                );
                metrics::counter!("proxy_tunnels_total", "outcome" => e.kind()).increment(1);
                e.into_response()
            }
        }
    }

    /// Establish a tunnel for an upgrade request.
    ///
    /// On success the returned response is the backend's handshake answer. A
    /// 101 answer has already spawned the task that takes over the client
    /// connection once the response is written.
    pub async fn establish(&self, mut request: Request<Body>) -> Result<Response, TunnelError> {
        let addr = self.target.socket_addr();
        let dialed = with_timeout(
            "backend dial",
            self.settings.connect_timeout,
            TcpStream::connect(addr.as_str()),
        )
        .await?;
        let mut backend = dialed.map_err(|source| TunnelError::Dial { addr, source })?;

        // Dropping `backend` on this early return closes it.
        let on_upgrade = request
            .extensions_mut()
            .remove::<OnUpgrade>()
            .ok_or(TunnelError::HijackUnsupported)?;

        let (parts, _body) = request.into_parts();
        let answer = with_timeout(
            "backend handshake",
            self.settings.handshake_timeout,
            handshake::exchange(&mut backend, &parts, &self.target),
        )
        .await??;

        if answer.status != StatusCode::SWITCHING_PROTOCOLS {
            tracing::info!(
                request_id = %request_id(&parts.headers),
                status = %answer.status,
                "Backend declined WebSocket upgrade"
            );
            metrics::counter!("proxy_tunnels_total", "outcome" => "declined").increment(1);
            let mut headers = answer.headers;
            crate::http::response::strip_hop_by_hop(&mut headers);
            headers.remove(header::CONTENT_LENGTH);
            let mut response = Response::new(Body::from(answer.remainder));
            *response.status_mut() = answer.status;
            response.headers_mut().extend(headers);
            return Ok(response);
        }

        let guard = self.tracker.track();
        let span = tracing::info_span!(
            "tunnel",
            tunnel_id = %guard.id(),
            request_id = %request_id(&parts.headers),
            path = %parts.uri.path(),
        );
        tokio::spawn(
            run_tunnel(on_upgrade, backend, answer.remainder, guard, self.settings.relay_policy)
                .instrument(span),
        );

        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *response.headers_mut() = answer.headers;
        Ok(response)
    }
}

/// Take over the client connection and relay until either side closes.
async fn run_tunnel(
    on_upgrade: OnUpgrade,
    backend: TcpStream,
    early: Bytes,
    mut guard: TunnelGuard,
    policy: RelayPolicy,
) {
    let upgraded = match on_upgrade.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            // The 101 is already committed; all that is left is to release the backend.
            let e = TunnelError::Hijack(e);
            tracing::warn!(error = %e, "WebSocket tunnel aborted");
            metrics::counter!("proxy_tunnels_total", "outcome" => e.kind()).increment(1);
            return;
        }
    };
    guard.hijacked();
    metrics::counter!("proxy_tunnels_total", "outcome" => "established").increment(1);
    tracing::info!("WebSocket tunnel established");

    let mut client = TokioIo::new(upgraded);
    if !early.is_empty() {
        if let Err(e) = client.write_all(&early).await {
            tracing::debug!(error = %e, "Client closed before early backend bytes were delivered");
            return;
        }
    }

    let started = Instant::now();
    let stats = relay(client, backend, policy).await;

    let up = stats.client_to_backend.unwrap_or(0);
    let down = stats.backend_to_client.unwrap_or(0) + early.len() as u64;
    metrics::counter!("proxy_tunnel_bytes_total", "direction" => "client_to_backend").increment(up);
    metrics::counter!("proxy_tunnel_bytes_total", "direction" => "backend_to_client").increment(down);
    tracing::info!(
        duration_ms = started.elapsed().as_millis() as u64,
        client_to_backend = ?stats.client_to_backend,
        backend_to_client = ?stats.backend_to_client,
        "WebSocket tunnel closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn exact_literals_match() {
        assert!(is_websocket_upgrade(&headers(&[
            ("upgrade", "websocket"),
            ("connection", "Upgrade"),
        ])));
    }

    #[test]
    fn missing_headers_do_not_match() {
        assert!(!is_websocket_upgrade(&HeaderMap::new()));
        assert!(!is_websocket_upgrade(&headers(&[("upgrade", "websocket")])));
        assert!(!is_websocket_upgrade(&headers(&[("connection", "Upgrade")])));
    }

    #[test]
    fn case_differences_do_not_match() {
        assert!(!is_websocket_upgrade(&headers(&[
            ("upgrade", "WebSocket"),
            ("connection", "Upgrade"),
        ])));
        assert!(!is_websocket_upgrade(&headers(&[
            ("upgrade", "websocket"),
            ("connection", "upgrade"),
        ])));
    }

    #[test]
    fn comma_joined_tokens_do_not_match() {
        assert!(!is_websocket_upgrade(&headers(&[
            ("upgrade", "websocket"),
            ("connection", "keep-alive, Upgrade"),
        ])));
    }

    #[test]
    fn only_first_value_counts() {
        assert!(!is_websocket_upgrade(&headers(&[
            ("upgrade", "websocket"),
            ("connection", "keep-alive"),
            ("connection", "Upgrade"),
        ])));
    }

    #[test]
    fn other_protocols_do_not_match() {
        assert!(!is_websocket_upgrade(&headers(&[
            ("upgrade", "h2c"),
            ("connection", "Upgrade"),
        ])));
    }

    #[test]
    fn lenient_accepts_tokens_and_case() {
        let map = headers(&[("upgrade", "WebSocket"), ("connection", "keep-alive, upgrade")]);
        assert!(!UpgradeMatch::Strict.matches(&map));
        assert!(UpgradeMatch::Lenient.matches(&map));
        assert!(!UpgradeMatch::Lenient.matches(&headers(&[("connection", "upgrade")])));
    }

    #[test]
    fn error_statuses() {
        let dial = TunnelError::Dial {
            addr: "127.0.0.1:1".into(),
            source: std::io::ErrorKind::ConnectionRefused.into(),
        };
        assert_eq!(dial.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(TunnelError::HijackUnsupported.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            TunnelError::Handshake(HandshakeError::Closed).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
