use anyhow::{Context, Result};
use axum::{Router, routing::get};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod channel;
mod config;
mod error;
mod handlers;
mod long_poll;
mod metrics;

#[cfg(test)]
mod test_helpers;

use crate::channel::ChannelService;
use crate::config::{CliOverrides, FileConfig, RelayConfig};
use crate::long_poll::LongPollSessions;
use crate::metrics::ServerMetrics;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Pairs inspected pages with remote devtools frontends")]
struct Cli {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Debug logging plus a line for every channel transition
    #[arg(short, long)]
    verbose: bool,

    /// Path prefix every route is mounted under
    #[arg(long)]
    base_path: Option<String>,

    /// Directory served for paths no relay route claims
    #[arg(long)]
    static_dir: Option<PathBuf>,

    /// Config file (defaults to ./relay.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            host: self.host.clone(),
            port: self.port,
            verbose: self.verbose,
            base_path: self.base_path.clone(),
            static_dir: self.static_dir.clone(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub channels: Arc<ChannelService>,
    pub long_poll: Arc<LongPollSessions>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
    pub config: Arc<RelayConfig>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    run_server(cli).await
}

/// Every relay route, mounted under the configured base path.
pub(crate) fn build_router(state: AppState) -> Router {
    let routes = Router::new()
        .route(
            "/target/{id}",
            get(handlers::target_get).post(handlers::target_post),
        )
        .route("/devtool/{id}", get(handlers::devtool_socket))
        .route("/get_targets", get(handlers::get_targets))
        // Health endpoints
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler));

    let routes = match &state.config.static_dir {
        Some(dir) => routes.fallback_service(ServeDir::new(dir)),
        None => routes,
    };

    let app = if state.config.base_path == "/" {
        routes
    } else {
        Router::new().nest(&state.config.base_path, routes)
    };

    app.layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// WebSocket URL the long-poll bridge dials to reach this relay.
pub(crate) fn relay_url(addr: SocketAddr, base_path: &str) -> String {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    let base = if base_path == "/" { "" } else { base_path };
    format!("ws://{}{}", SocketAddr::new(ip, addr.port()), base)
}

async fn run_server(cli: Cli) -> Result<()> {
    let mut file_config: FileConfig = config::load_config(cli.config.as_deref())
        .extract()
        .context("Invalid configuration")?;
    file_config.apply(cli.overrides());
    let config = RelayConfig::from_file(&file_config);

    // Setup logging
    let default_directive = if config.verbose {
        "devtool_relay=debug,tower_http=debug,info"
    } else {
        "devtool_relay=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting devtools relay");

    let addr = format!("{}:{}", config.host, config.port)
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address {}:{}", config.host, config.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    let metrics = Arc::new(ServerMetrics::new());
    let channels = ChannelService::start(metrics.clone());
    let long_poll = LongPollSessions::new(
        relay_url(actual_addr, &config.base_path),
        config.long_poll.clone(),
        metrics.clone(),
    );

    // Held until shutdown; dropping it detaches the logger.
    let _lifecycle_log = config
        .verbose
        .then(|| handlers::log_lifecycle(&channels));

    let routes = [
        ("WS  ", "/target/{id}", "Inspected page"),
        ("WS  ", "/devtool/{id}?targetId=", "Devtools frontend"),
        ("POST", "/target/{id}", "Long-poll fallback"),
        ("GET ", "/target/{id}", "Long-poll event stream"),
        ("GET ", "/get_targets", "Live channels"),
    ]
    .map(|(method, path, what)| format!("  {} {:<32} - {}", method, config.route(path), what));

    let app_state = AppState {
        channels,
        long_poll,
        metrics,
        config: Arc::new(config),
    };
    let app = build_router(app_state);

    info!("Relay listening on http://{}", actual_addr);
    for route in &routes {
        info!("{}", route);
    }

    // Create shutdown signal handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    info!("Shutdown complete");
    Ok(())
}
