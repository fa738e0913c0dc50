//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Resolve the backend target once at startup
//! - Create Axum Router with a catch-all dispatch handler
//! - Wire up middleware (tracing, request ID)
//! - Dispatch requests: WebSocket upgrades to the tunnel, everything else
//!   to the forwarder
//! - Serve over TLS with graceful shutdown and tunnel drain

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    response::Response,
    routing::any,
    Router,
};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tower_http::trace::TraceLayer;

use crate::config::{BackendTarget, ProxyConfig, TargetError};
use crate::http::forward::{ErrorHandler, Forwarder};
use crate::http::request::{propagate_request_id_layer, request_id, set_request_id_layer};
use crate::http::websocket::{TunnelEstablisher, TunnelSettings, UpgradeMatch};
use crate::net::tls::load_tls_config;
use crate::net::TunnelTracker;

/// Fatal server errors. Per-request failures never surface here.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error("failed to load TLS certificate: {0}")]
    Tls(#[source] std::io::Error),
    #[error("invalid listen address {address:?}: {source}")]
    Address {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("HTTPS server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub forwarder: Forwarder,
    pub tunnels: TunnelEstablisher,
    pub upgrade_match: UpgradeMatch,
}

/// HTTP server for the reverse proxy.
pub struct HttpServer {
    config: ProxyConfig,
    target: Arc<BackendTarget>,
    state: AppState,
    tracker: TunnelTracker,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ProxyConfig) -> Result<Self, ServerError> {
        let target = Arc::new(BackendTarget::parse(&config.backend.url)?);
        let tracker = TunnelTracker::new();

        let forwarder = Forwarder::new(
            target.clone(),
            Duration::from_secs(config.timeouts.connect_secs),
            Duration::from_secs(config.timeouts.request_secs),
        );
        let tunnels = TunnelEstablisher::new(
            target.clone(),
            TunnelSettings::from(&config),
            tracker.clone(),
        );

        let state = AppState {
            forwarder,
            tunnels,
            upgrade_match: config.tunnel.upgrade_match,
        };

        Ok(Self {
            config,
            target,
            state,
            tracker,
        })
    }

    /// Replace the forwarder's error callback.
    pub fn with_error_handler(mut self, handler: impl ErrorHandler) -> Self {
        self.state.forwarder = self.state.forwarder.with_error_handler(handler);
        self
    }

    /// Build the Axum router with all middleware layers.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/{*path}", any(proxy_handler))
            .route("/", any(proxy_handler))
            .with_state(self.state.clone())
            .layer(propagate_request_id_layer())
            .layer(TraceLayer::new_for_http())
            .layer(set_request_id_layer())
    }

    /// Serve HTTPS until `shutdown` fires, then drain open tunnels.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServerError> {
        let tls = load_tls_config(&self.config.tls)
            .await
            .map_err(ServerError::Tls)?;

        let address = self.config.server.listen_address();
        let addr: SocketAddr = address
            .parse()
            .map_err(|source| ServerError::Address { address, source })?;

        let grace = Duration::from_secs(self.config.timeouts.shutdown_grace_secs);
        let handle = axum_server::Handle::new();
        // One deadline covers both the HTTP connection drain and the tunnel drain.
        let (deadline_tx, deadline_rx) = oneshot::channel::<Instant>();
        {
            let handle = handle.clone();
            tokio::spawn(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received, draining connections");
                let _ = deadline_tx.send(Instant::now() + grace);
                handle.graceful_shutdown(Some(grace));
            });
        }

        tracing::info!(
            address = %addr,
            domain = %self.config.server.domain,
            backend = %self.target,
            "HTTPS reverse proxy listening"
        );

        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(app)
            .await?;

        let remaining = match deadline_rx.await {
            Ok(deadline) => deadline.saturating_duration_since(Instant::now()),
            Err(_) => grace,
        };
        if !self.tracker.wait_for_drain(remaining).await {
            tracing::warn!(
                open_tunnels = self.tracker.active_count(),
                "Grace period elapsed with tunnels still open"
            );
        }

        tracing::info!("HTTPS server stopped");
        Ok(())
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// The resolved backend origin.
    pub fn target(&self) -> &BackendTarget {
        &self.target
    }

    /// Live tunnel tracker.
    pub fn tunnels(&self) -> &TunnelTracker {
        &self.tracker
    }
}

/// Catch-all handler: classify, then tunnel or forward.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let start_time = Instant::now();
    let client_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let request_id = request_id(request.headers()).to_string();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let (kind, response) = if state.upgrade_match.matches(request.headers()) {
        tracing::debug!(request_id = %request_id, path = %path, "WebSocket upgrade request");
        ("websocket", state.tunnels.handle(request).await)
    } else {
        tracing::debug!(request_id = %request_id, method = %method, path = %path, "Proxying request");
        ("http", state.forwarder.forward(request, client_addr).await)
    };

    let status = response.status();
    metrics::counter!(
        "proxy_requests_total",
        "kind" => kind,
        "status" => status.as_str().to_owned()
    )
    .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "kind" => kind)
        .record(start_time.elapsed().as_secs_f64());

    response
}
