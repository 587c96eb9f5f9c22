#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # vtrund
//!
//! Server-side terminal session runtime. Exposes HTTP and WebSocket APIs
//! that let any authenticated client create, observe, and drive PTY-backed
//! shell sessions — each session owned end to end by its own
//! `vtrund-forwarder` child process.
//!
//! ## Subcommands
//!
//! - `vtrund serve` (default) — run the HTTP/WS server
//! - `vtrund supervise` — run as supervisor: starts server and restarts on crash

mod supervisor;

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Instant;

use axum::{middleware, routing::get, Extension, Router};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use vtrund::{
    auth::ApiKey,
    config::Config,
    events::EventBus,
    hq::{self, HqState},
    hub::Hub,
    routes,
    sessions::SessionManager,
    state::AppState,
    ws,
};

/// Server-side terminal session runtime.
#[derive(Parser)]
#[command(name = "vtrund", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run as supervisor: starts server and restarts on crash.
    Supervise {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Supervise { config }) => {
            run_supervisor_mode(config.as_deref()).await;
        }
        Some(Commands::Serve { config }) => {
            run_server(config.as_deref()).await;
        }
        None => {
            let args: Vec<String> = std::env::args().collect();
            let config_path = args.windows(2).find(|w| w[0] == "--config").map(|w| w[1].clone());
            run_server(config_path.as_deref()).await;
        }
    }
}

async fn run_supervisor_mode(config_path: Option<&str>) -> ! {
    let config = Config::load(config_path);
    tracing_subscriber::fmt().with_env_filter(config.log_filter()).init();

    info!("vtrund supervisor starting");
    supervisor::run_supervisor(config_path, &config.supervisor).await
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);
    tracing_subscriber::fmt().with_env_filter(config.log_filter()).init();

    info!("vtrund v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key — set VIBETUNNEL_API_KEY or update config");
    }

    let session_manager = SessionManager::new(&config.session.control_dir);
    let reconciled = session_manager.sweep_orphans().await;
    if !reconciled.is_empty() {
        warn!(count = reconciled.len(), "reconciled orphaned sessions at startup");
    }

    let hub = Hub::new(session_manager.clone());
    let event_bus = EventBus::new();

    let hq_config = config.hq.clone();
    let hq_state = hq_config.as_ref().filter(|c| c.enabled).map(|c| HqState::new(c.hq_key.clone()));

    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        session_manager,
        hub,
        event_bus,
        hq: hq_state.clone(),
        sse_connections: Arc::new(AtomicU32::new(0)),
    };

    let public_routes = Router::new().route("/api/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route("/api/sessions", get(routes::sessions::list_sessions).post(routes::sessions::create_session))
        .route("/api/sessions/{id}", get(routes::sessions::get_session).delete(routes::sessions::delete_session))
        .route("/api/sessions/{id}/input", axum::routing::post(routes::sessions::input))
        .route("/api/sessions/{id}/resize", axum::routing::post(routes::sessions::resize))
        .route("/api/sessions/{id}/text", get(routes::sessions::text))
        .route("/api/cleanup-exited", axum::routing::post(routes::sessions::cleanup_exited))
        .route("/events", get(routes::events::event_stream))
        .layer(middleware::from_fn(vtrund::auth::require_api_key));

    let ws_route = Router::new().route("/ws", get(ws::ws_upgrade));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([axum::http::header::AUTHORIZATION, axum::http::header::CONTENT_TYPE, axum::http::header::ACCEPT]);

    let mut app = Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_route)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .with_state(state.clone());

    if let Some(hq) = &hq_state {
        info!("HQ aggregator mode enabled");
        app = app.merge(hq::hq_router(hq.clone()));
    }

    let app = app.layer(cors).layer(TraceLayer::new_for_http()).layer(
        tower::limit::ConcurrencyLimitLayer::new(state.config.server.max_connections),
    );

    let listener = TcpListener::bind(&state.config.server.listen).await.expect("Failed to bind");
    info!("Server ready");

    let remote_task = hq_config.filter(|c| c.remote_url.is_some()).map(|c| hq::spawn_remote(state.clone(), c));

    let sweep_mgr = state.session_manager.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            let reconciled = sweep_mgr.sweep_orphans().await;
            for id in reconciled {
                warn!(session_id = %id, "reconciled orphaned session");
            }
        }
    });

    let hq_sweep_task = hq_state.clone().map(|hq| {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(15));
            loop {
                interval.tick().await;
                let dead = hq.sweep_dead().await;
                for id in dead {
                    warn!(remote_id = %id, "evicted dead remote");
                }
            }
        })
    });

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await.expect("Server error");

    info!("Shutting down...");
    sweep_task.abort();
    if let Some(task) = hq_sweep_task {
        task.abort();
    }
    if let Some(task) = remote_task {
        task.abort();
    }
    info!("Goodbye");
}
