//! Parley Server - Main entry point

use clap::Parser;
use std::sync::Arc;

use parley_core::{
    api::{self, AppState},
    config::Config,
    db::{ChatStore, MemoryChatStore, PgChatStore},
    telemetry,
    websocket::WebSocketState,
};

/// Real-time chat server.
#[derive(Debug, Parser)]
#[command(name = "parley-server", version, about)]
struct Args {
    /// Configuration file, overlaid by PARLEY__* environment variables
    #[arg(short, long, env = "PARLEY_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = match args.config.as_deref() {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    let telemetry = telemetry::init_telemetry(&config.telemetry)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Parley Server"
    );

    let store: Arc<dyn ChatStore> = match config.database.url.as_deref() {
        Some(url) => {
            let store = PgChatStore::connect(url, &config.database).await?;
            if config.database.run_migrations {
                store.migrate().await?;
                tracing::info!("Database migrations applied");
            }
            tracing::info!(
                max_connections = config.database.max_connections,
                "Connected to database"
            );
            Arc::new(store)
        }
        None => {
            tracing::warn!("No database.url configured, using the in-memory chat store");
            Arc::new(MemoryChatStore::new())
        }
    };

    let ws_state = Arc::new(WebSocketState::new(store.clone(), config.websocket.clone()));
    let app_state = AppState::new(store, ws_state, telemetry.metrics.clone());

    let app = api::build_router(app_state);

    let addr = config.bind_address();
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    telemetry.shutdown();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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

    tracing::info!("Shutdown signal received");
}
