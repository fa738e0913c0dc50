//! TLS reverse proxy with WebSocket pass-through.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌──────────────────────────────────────────────────┐
//!                      │                  REVERSE PROXY                   │
//!     Client (TLS)     │  ┌─────────┐    ┌──────────┐                     │
//!     ─────────────────┼─▶│ net/tls │───▶│   http   │                     │
//!                      │  └─────────┘    │  server  │                     │
//!                      │                 └────┬─────┘                     │
//!                      │          upgrade?    │                           │
//!                      │        ┌─────no──────┴──────yes─────┐            │
//!                      │        ▼                            ▼            │
//!                      │  ┌───────────┐             ┌──────────────┐      │
//!                      │  │ forwarder │             │    tunnel    │      │
//!                      │  │ (hyper    │             │ dial, replay │      │
//!                      │  │  client)  │             │ handshake,   │      │
//!                      │  └─────┬─────┘             │ hijack       │      │
//!                      │        │                   └──────┬───────┘      │
//!                      │        │                          ▼              │
//!                      │        │                   ┌──────────────┐      │
//!                      │        │                   │ duplex relay │      │
//!                      │        │                   └──────┬───────┘      │
//!                      └────────┼──────────────────────────┼──────────────┘
//!                               ▼                          ▼
//!                                      Backend origin
//! ```

use std::path::PathBuf;

use clap::Parser;

use tls_ws_proxy::config::load_config;
use tls_ws_proxy::observability::logging::{self, LogFormat};
use tls_ws_proxy::observability::metrics::init_metrics;
use tls_ws_proxy::{HttpServer, Shutdown};

#[derive(Parser)]
#[command(name = "tls-ws-proxy")]
#[command(about = "TLS reverse proxy with WebSocket pass-through", long_about = None)]
struct Cli {
    /// Path to the configuration file (YAML, or TOML with a .toml extension)
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    tracing::info!("tls-ws-proxy v{} starting", env!("CARGO_PKG_VERSION"));

    let config = load_config(&cli.config).map_err(|e| {
        tracing::error!(path = %cli.config.display(), error = %e, "Failed to load configuration");
        e
    })?;

    tracing::info!(
        listen_port = config.server.listen_port,
        domain = %config.server.domain,
        relay_policy = ?config.tunnel.relay_policy,
        "Configuration loaded"
    );

    let server = HttpServer::new(config).map_err(|e| {
        tracing::error!(error = %e, "Failed to resolve backend target");
        e
    })?;
    tracing::info!(backend = %server.target(), "Backend target resolved");

    if cli.check {
        tracing::info!("Configuration OK");
        return Ok(());
    }

    if let Some(addr) = &server.config().observability.metrics_address {
        // Validation guarantees this parses.
        if let Ok(addr) = addr.parse() {
            if let Err(e) = init_metrics(addr) {
                tracing::error!(error = %e, "Failed to start metrics endpoint");
            }
        }
    }

    let shutdown = Shutdown::new();
    shutdown.trigger_on_signal();

    server.run(shutdown.subscribe()).await.map_err(|e| {
        tracing::error!(error = %e, "HTTPS server failed");
        e
    })?;

    tracing::info!("Shutdown complete");
    Ok(())
}
