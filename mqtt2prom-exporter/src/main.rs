// mqtt2prom Exporter - Prometheus exporter for device telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # mqtt2prom Exporter
//!
//! Serves metrics derived from device messages by mqtt2prom rules, with
//! recorded-message replay.
//!
//! ## Usage
//!
//! ```bash
//! # Replay recorded messages ten times faster than recorded
//! mqtt2prom-exporter --config config.yaml --replay messages.jsonl --speed 10.0
//!
//! # Listen on a custom address
//! mqtt2prom-exporter --config config.yaml --listen 127.0.0.1:9090
//! ```

mod cache;
mod ingest;
mod metrics;
mod replay;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use clap::Parser;
use mqtt2prom::{Config, ConfigError, Transformer};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use cache::PresentationCache;
use ingest::Ingestor;
use metrics::encode_metrics;
use replay::{ReplayConfig, ReplayEngine, ReplayState};

/// mqtt2prom Prometheus Exporter
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:9641")]
    listen: SocketAddr,

    /// JSON-lines file of recorded messages to replay
    #[arg(short, long)]
    replay: Option<PathBuf>,

    /// Replay speed multiplier (1.0 = recorded pace)
    #[arg(short, long, default_value = "1.0")]
    speed: f64,

    /// Loop the replay when it reaches the end
    #[arg(long)]
    loop_replay: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Fatal exporter errors.
#[derive(Debug, thiserror::Error)]
enum ExporterError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Application state shared across handlers.
struct AppState {
    transformer: Arc<Transformer>,
    cache: Arc<PresentationCache>,
    replay_state: Option<Arc<ReplayState>>,
    start_time: std::time::Instant,
}

#[tokio::main]
async fn main() -> Result<(), ExporterError> {
    let args = Args::parse();

    // Initialize tracing
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

    info!("mqtt2prom Exporter v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&args.config)?;
    let transformer = Arc::new(Transformer::from_config(&config));
    let cache = Arc::new(PresentationCache::new(config.cache.timeout));
    let ingestor = Arc::new(Ingestor::new(
        &config,
        Arc::clone(&transformer),
        Arc::clone(&cache),
    ));

    info!(
        "Rules loaded: {} rules for {} inbound metrics",
        transformer.index().len(),
        transformer.index().source_names().len()
    );

    // Start replay if a file was given
    let replay_state = if let Some(path) = args.replay.clone() {
        let replay_config = ReplayConfig {
            path,
            speed: args.speed,
            loop_replay: args.loop_replay,
        };

        match ReplayEngine::from_file(replay_config, Arc::clone(&ingestor)) {
            Ok(engine) => {
                let state = engine.state();
                tokio::spawn(async move {
                    engine.run().await;
                });
                Some(state)
            }
            Err(e) => {
                error!("Failed to load replay: {}", e);
                None
            }
        }
    } else {
        info!("No replay file specified, serving self-metrics only");
        None
    };

    let state = Arc::new(AppState {
        transformer: Arc::clone(&transformer),
        cache,
        replay_state,
        start_time: std::time::Instant::now(),
    });

    // Build router
    let app = Router::new()
        .route("/", get(root_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/status", get(status_handler))
        .with_state(state);

    info!("Starting server on http://{}", args.listen);
    info!("Metrics endpoint: http://{}/metrics", args.listen);

    let listener = TcpListener::bind(args.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    match transformer.flush_all() {
        Ok(written) => info!("State flushed: {} files written", written),
        Err(e) => error!("Failed to flush state: {}", e),
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Root handler - shows a simple HTML page.
async fn root_handler() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>mqtt2prom Exporter</title>
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; max-width: 800px; margin: 50px auto; padding: 20px; }
        h1 { color: #2c3e50; }
        a { color: #3498db; text-decoration: none; }
        .endpoints { background: #f8f9fa; padding: 20px; border-radius: 8px; margin: 20px 0; }
        .endpoint { margin: 10px 0; }
        code { background: #e9ecef; padding: 2px 6px; border-radius: 4px; }
    </style>
</head>
<body>
    <h1>mqtt2prom Exporter</h1>
    <p>Prometheus metrics derived from device messages.</p>

    <div class="endpoints">
        <h2>Endpoints</h2>
        <div class="endpoint"><a href="/metrics">/metrics</a> - Prometheus metrics</div>
        <div class="endpoint"><a href="/health">/health</a> - Health check</div>
        <div class="endpoint"><a href="/ready">/ready</a> - Readiness check</div>
        <div class="endpoint"><a href="/status">/status</a> - Status information (JSON)</div>
    </div>

    <h2>Exporter metrics</h2>
    <ul>
        <li><code>mqtt2prom_messages_processed_total</code> - Messages processed</li>
        <li><code>mqtt2prom_records_emitted_total</code> - Records produced by rules</li>
        <li><code>mqtt2prom_transform_errors_total</code> - Failures per rule</li>
        <li><code>mqtt2prom_cached_series</code> - Exposed series</li>
    </ul>
</body>
</html>"#,
    )
}

/// Metrics handler - returns Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_metrics(state.cache.families()) {
        Ok(body) => (
            StatusCode::OK,
            [("Content-Type", "text/plain; charset=utf-8")],
            body,
        ),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("Content-Type", "text/plain; charset=utf-8")],
                e.to_string(),
            )
        }
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness check handler. Rules are loaded before the listener starts.
async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.transformer.index().is_empty() {
        return (StatusCode::SERVICE_UNAVAILABLE, "No rules configured");
    }
    (StatusCode::OK, "Ready")
}

/// Status information response.
#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_secs: u64,
    rules: usize,
    inbound_metrics: Vec<String>,
    cached_series: usize,
    state_entries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    replay: Option<ReplayStatus>,
}

/// Replay status information.
#[derive(Serialize)]
struct ReplayStatus {
    running: bool,
    position: usize,
    total_messages: usize,
    passes: usize,
    progress_percent: f64,
}

/// Status handler - returns JSON status information.
async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let replay = state.replay_state.as_ref().map(|replay_state| {
        let position = replay_state.position.load(Ordering::SeqCst);
        let total = replay_state.total_messages.load(Ordering::SeqCst);
        let progress = if total > 0 {
            (position as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        ReplayStatus {
            running: replay_state.running.load(Ordering::SeqCst),
            position,
            total_messages: total,
            passes: replay_state.passes.load(Ordering::SeqCst),
            progress_percent: progress,
        }
    });

    let index = state.transformer.index();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        rules: index.len(),
        inbound_metrics: index.source_names().into_iter().map(str::to_string).collect(),
        cached_series: state.cache.len(),
        state_entries: state.transformer.store().len(),
        replay,
    })
}
