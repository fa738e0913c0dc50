//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): requests by kind (http/websocket) and status
//! - `proxy_request_duration_seconds` (histogram): time to response head
//! - `proxy_upstream_errors_total` (counter): forwarding failures by kind
//! - `proxy_tunnels_total` (counter): tunnel outcomes
//! - `proxy_tunnels_active` (gauge): currently open tunnels
//! - `proxy_tunnel_bytes_total` (counter): relayed bytes by direction
//!
//! Recording is a no-op until [`init_metrics`] installs the exporter.

use std::net::SocketAddr;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder with an HTTP scrape listener on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe();
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

fn describe() {
    describe_counter!("proxy_requests_total", "Requests handled, by kind and status");
    describe_histogram!(
        "proxy_request_duration_seconds",
        Unit::Seconds,
        "Time until the response head was produced"
    );
    describe_counter!("proxy_upstream_errors_total", "Failed forwards, by kind");
    describe_counter!("proxy_tunnels_total", "WebSocket tunnel outcomes");
    describe_gauge!("proxy_tunnels_active", "Open WebSocket tunnels");
    describe_counter!(
        "proxy_tunnel_bytes_total",
        Unit::Bytes,
        "Bytes relayed through tunnels, by direction"
    );
}
