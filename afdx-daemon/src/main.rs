// AFDX Daemon - TDMA gateway service
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # AFDX Daemon
//!
//! Runs the TDMA gateway on UDP and exposes Prometheus metrics and status
//! over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a configuration file
//! afdx-daemon --config gateway.json
//!
//! # Override ports
//! afdx-daemon --config gateway.json --udp-port 6005 --http-port 9100
//! ```

mod metrics;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use afdx::{HealthCheck, HealthStatus};
use afdx_gateway::{GatewayConfig, GatewayError, GatewayServer, Snapshot};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use clap::Parser;
use crate::metrics::{encode_metrics, PrometheusObserver};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// AFDX-lite TDMA gateway
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// UDP port for device traffic
    #[arg(long)]
    udp_port: Option<u16>,

    /// HTTP port for metrics and status
    #[arg(long)]
    http_port: Option<u16>,

    /// Fallback log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Error)]
enum DaemonError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Cannot register metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("HTTP server error: {0}")]
    Http(#[from] std::io::Error),

    #[error("Gateway task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Shared by the HTTP handlers
struct AppState {
    snapshots: watch::Receiver<Snapshot>,
    launched: Instant,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize tracing; `log` records from the core are bridged in
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("AFDX Gateway v{}", env!("CARGO_PKG_VERSION"));

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

/// Load the configuration file, apply command-line overrides and validate
fn load_config(args: &Args) -> Result<GatewayConfig, GatewayError> {
    let mut config = match &args.config {
        Some(path) => GatewayConfig::load(path)?,
        None => {
            info!("No configuration file given, using defaults");
            GatewayConfig::default()
        }
    };
    if let Some(port) = args.udp_port {
        config.network.udp_port = port;
    }
    if let Some(port) = args.http_port {
        config.network.http_port = port;
    }
    config.validate()?;
    Ok(config)
}

async fn run(args: Args) -> Result<(), DaemonError> {
    let config = load_config(&args)?;
    let http_addr = SocketAddr::new(config.network.bind_address, config.network.http_port);

    let observer = Arc::new(PrometheusObserver::new()?);
    let server = GatewayServer::bind(config, observer.clone()).await?;
    info!("Gateway listening on udp://{}", server.local_addr()?);

    // Keep gauges in step with published snapshots
    let mut updates = server.subscribe();
    let exporter = tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();
            observer.observe_snapshot(&snapshot);
        }
    });

    let (stop_tx, stop_rx) = watch::channel(false);
    let state = Arc::new(AppState {
        snapshots: server.subscribe(),
        launched: Instant::now(),
    });
    let gateway = tokio::spawn(server.run(stopped(stop_rx)));

    let app = Router::new()
        .route("/", get(index))
        .route("/metrics", get(export_metrics))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/status", get(status))
        .with_state(state);

    // Dropping `stop_tx` also stops the gateway if serving fails
    info!(addr = %http_addr, "serving http endpoints");
    let served = match TcpListener::bind(http_addr).await {
        Ok(listener) => {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        warn!("Cannot listen for Ctrl-C: {}", err);
                        std::future::pending::<()>().await;
                    }
                    info!("Shutdown requested");
                    let _ = stop_tx.send(true);
                })
                .await
        }
        Err(err) => {
            drop(stop_tx);
            Err(err)
        }
    };

    let gateway = gateway.await??;
    exporter.abort();
    info!(
        received = gateway.stats().messages_received,
        sent = gateway.stats().messages_sent,
        dropped = gateway.stats().dropped,
        "Gateway stopped"
    );
    served?;
    Ok(())
}

/// Resolves once a stop is signalled or the sender is gone
async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

/// Index of the HTTP endpoints
async fn index() -> Html<&'static str> {
    Html(concat!(
        "<!DOCTYPE html><html><head><title>AFDX Gateway</title></head><body>",
        "<h1>AFDX Gateway</h1>",
        "<p>TDMA gateway for field devices, version ",
        env!("CARGO_PKG_VERSION"),
        "</p><ul>",
        "<li><a href=\"/metrics\">/metrics</a>: Prometheus exposition</li>",
        "<li><a href=\"/health\">/health</a>: component checks, 503 when unhealthy</li>",
        "<li><a href=\"/ready\">/ready</a>: 200 while the gateway loop runs</li>",
        "<li><a href=\"/status\">/status</a>: JSON status snapshot</li>",
        "</ul></body></html>",
    ))
}

const TEXT_PLAIN: [(header::HeaderName, &str); 1] =
    [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")];

async fn export_metrics() -> impl IntoResponse {
    match encode_metrics() {
        Ok(body) => (StatusCode::OK, TEXT_PLAIN, body),
        Err(err) => {
            warn!(error = %err, "metrics encoding failed");
            (StatusCode::INTERNAL_SERVER_ERROR, TEXT_PLAIN, err.to_string())
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: HealthStatus,
    checks: Vec<HealthCheck>,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.snapshots.borrow().clone();
    let code = if snapshot.health.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(HealthResponse {
            status: snapshot.health,
            checks: snapshot.checks,
        }),
    )
}

async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.snapshots.borrow().status.running {
        (StatusCode::OK, "Ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Not ready")
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    version: &'static str,
    process_uptime_secs: u64,
    gateway: Snapshot,
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        process_uptime_secs: state.launched.elapsed().as_secs(),
        gateway: state.snapshots.borrow().clone(),
    })
}
