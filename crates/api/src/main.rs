use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use canvasflow_events::EventBus;
use canvasflow_pipeline::config::EngineConfig;
use canvasflow_pipeline::Engine;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use canvasflow_api::config::ServerConfig;
use canvasflow_api::router::build_app_router;
use canvasflow_api::state::AppState;
use canvasflow_api::ws;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "canvasflow_api=debug,canvasflow_pipeline=debug,tower_http=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");
    let engine_config = EngineConfig::from_env();
    tracing::info!(
        output_dir = %engine_config.output_dir.display(),
        state_dir = %engine_config.state_dir.display(),
        "Loaded engine configuration",
    );

    // --- Engine ---
    let event_bus = Arc::new(EventBus::default());
    let engine = Engine::build(engine_config, Arc::clone(&event_bus))
        .await
        .expect("Failed to start execution engine");
    let online = engine.warm_up().await;
    tracing::info!(online, "Backend registry warmed up");

    let background_cancel = CancellationToken::new();
    let background = engine.spawn_background(&background_cancel);

    // --- WebSocket ---
    let ws_manager = Arc::new(ws::WsManager::new());
    let ws_tasks = [
        ws::start_heartbeat(Arc::clone(&ws_manager), background_cancel.clone()),
        ws::start_event_forwarder(&event_bus, Arc::clone(&ws_manager), background_cancel.clone()),
    ];

    // --- App state + router ---
    let state = AppState::from_engine(&engine, Arc::new(config.clone()), Arc::clone(&ws_manager));
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    background_cancel.cancel();
    let grace = Duration::from_secs(config.shutdown_timeout_secs);
    let stopped = tokio::time::timeout(
        grace,
        futures::future::join_all(background.into_iter().chain(ws_tasks)),
    )
    .await;
    if stopped.is_err() {
        tracing::warn!(grace_secs = grace.as_secs(), "Background tasks did not stop in time");
    }

    ws_manager.shutdown_all().await;
    tracing::info!("Graceful shutdown complete");
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
