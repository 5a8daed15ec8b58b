//! Conversion Studio Server
//!
//! HTTP front door of the conversion studio: starts and cancels agent jobs,
//! streams their output and the watched directory trees over SSE, and exposes
//! the credential refresh state.

mod handlers;
mod settings;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use convstudio_core::{AuthRefreshDaemon, DirectoryWatcher, ProcessSupervisor, StudioConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "convstudio-server", version, about = "Code Conversion Studio server")]
struct Cli {
    /// Configuration file (defaults to ./studio.toml when present)
    #[arg(short, long, env = "STUDIO_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overrides server.bind_address
    #[arg(short, long)]
    bind: Option<String>,

    /// Directory with the browser UI, overrides server.static_dir
    #[arg(long)]
    static_dir: Option<PathBuf>,

    /// Debug logging unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<StudioConfig>,
    pub auth: Arc<AuthRefreshDaemon>,
    pub supervisor: ProcessSupervisor,
    pub watcher: DirectoryWatcher,
}

impl AppState {
    pub fn new(config: StudioConfig) -> Result<Self> {
        let auth = Arc::new(AuthRefreshDaemon::new(config.auth.clone()));
        let supervisor =
            ProcessSupervisor::new(config.supervisor.clone(), &config.stream, Arc::clone(&auth))
                .context("Failed to build process supervisor")?;
        let watcher = DirectoryWatcher::new(&config.watcher, config.stream.subscriber_capacity);
        Ok(Self {
            config: Arc::new(config),
            auth,
            supervisor,
            watcher,
        })
    }
}

#[tokio::main]
async fn main() {
    // Set up panic hook to log crashes
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()));
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };
        eprintln!("[PANIC] at {:?}: {}", location, payload);
        tracing::error!("PANIC at {:?}: {}", location, payload);
    }));

    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("[FATAL] Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    info!(
        "Starting Conversion Studio Server v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!("PID: {}", std::process::id());

    if let Err(e) = run_server(cli).await {
        error!("Server failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run_server(cli: Cli) -> Result<()> {
    info!("Loading configuration...");
    let mut config =
        settings::load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(bind) = cli.bind {
        config.server.bind_address = bind;
    }
    if let Some(dir) = cli.static_dir {
        config.server.static_dir = Some(dir);
    }
    info!(
        "Config loaded: bind={}, agent={}, roots={}",
        config.server.bind_address,
        config.agent.program,
        config.watcher.roots.len()
    );

    let state = AppState::new(config)?;

    // Resolve credentials before the first job can start
    if let Err(e) = state.auth.refresh_now().await {
        warn!("Initial credential refresh failed: {}", e);
    }
    state.auth.start();
    state.watcher.start();

    let app = build_router(state.clone());

    let addr: SocketAddr = state
        .config
        .server
        .bind_address
        .parse()
        .context("Failed to parse bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(handlers::health))
        .route("/process", post(handlers::process::start))
        .route("/process/status", get(handlers::process::status))
        .route("/process/:id/cancel", post(handlers::process::cancel))
        .route("/stream", get(handlers::process::stream))
        .route("/api/files/stream", get(handlers::files::stream))
        .route("/api/auth/status", get(handlers::auth::status))
        .route("/api/auth/refresh", post(handlers::auth::refresh));

    if let Some(static_dir) = &state.config.server.static_dir {
        info!("Static files directory: {}", static_dir.display());
        let index = ServeFile::new(static_dir.join("index.html"));
        app = app.fallback_service(ServeDir::new(static_dir).fallback(index));
    }

    app.layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    )
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown requested, stopping jobs and streams");
    state.supervisor.shutdown().await;
    state.watcher.stop();
    state.auth.stop();
}
