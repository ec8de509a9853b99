//! # VFS Access Bridge
//!
//! Reference server exposing a sandboxed local filesystem over the
//! WebSocket RPC transport and the RESTful HTTP gateway described in
//! this workspace's contracts.
//!
//! ## Architecture
//!
//! The binary wires together:
//! - `bridge_config` for layered configuration (env > file > defaults)
//! - `bridge_server::LocalVfs` as the concrete `Vfs` backend
//! - `bridge_server::gateway` for the HTTP surface
//! - `bridge_server::ws_transport` for the RPC surface

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::Router;
use bridge_config::{Config, ConfigLoader};
use bridge_contracts::Vfs;
use bridge_server::gateway::{self, GatewayState};
use bridge_server::ws_transport::{self, WsState};
use bridge_server::LocalVfs;
use clap::Parser;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments for the VFS access bridge server.
#[derive(Parser, Debug)]
#[command(name = "bridge-server")]
#[command(about = "VFS access bridge: WebSocket RPC transport and HTTP gateway over a sandboxed filesystem")]
struct Args {
    /// Server port (overrides config)
    #[arg(short, long, env = "BRIDGE_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "BRIDGE_HOST")]
    host: Option<String>,

    /// Root directory the VFS is sandboxed to (overrides config)
    #[arg(long, env = "BRIDGE_VFS_ROOT")]
    vfs_root: Option<PathBuf>,

    /// Path to a bridge.toml config file
    #[arg(long, env = "BRIDGE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Clone)]
struct HealthState {
    started: Arc<Instant>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bridge_server=debug,bridge_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut loader = ConfigLoader::new();
    if let Some(config_path) = &args.config {
        loader = loader.with_config_path(config_path);
    }
    let loaded = loader.load()?;
    for warning in &loaded.warnings.0 {
        warn!("{warning}");
    }

    let mut config: Config = loaded.config;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(vfs_root) = args.vfs_root {
        config.vfs.root = vfs_root;
    }

    info!("configuration loaded");
    info!("vfs root: {}", config.vfs.root.display());
    info!("gateway mount: {}", config.gateway.mount);

    let vfs: Arc<dyn Vfs> = Arc::new(LocalVfs::new(config.vfs.root.clone()));

    let health = HealthState { started: Arc::new(Instant::now()) };

    let gateway_router = gateway::router(GatewayState::new(vfs.clone(), config.gateway.clone()));
    let ws_router = Router::new().route("/rpc/ws", any(ws_transport::websocket_handler)).with_state(WsState { vfs });

    let cors = if config.cors.allowed_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = config
            .cors
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins).allow_methods(tower_http::cors::Any).allow_headers(tower_http::cors::Any)
    };

    let app = Router::new()
        .route("/healthz", get(health_handler))
        .with_state(health)
        .merge(ws_router)
        .merge(gateway_router)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("starting VFS access bridge on {}:{}", config.server.host, config.server.port);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

/// Unauthenticated health check outside the gateway mount, reporting
/// process uptime and the number of currently-open RPC sockets.
async fn health_handler(State(state): State<HealthState>) -> Response {
    Json(json!({
        "status": "healthy",
        "uptimeSecs": state.started.elapsed().as_secs(),
        "openConnections": ws_transport::open_connections(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}
