//! Backup Server
//!
//! Accepts chunked, resumable backup uploads, assigns each backup set a
//! monotonically increasing version and verifies every assembled file
//! against its SHA-256 checksum before committing it.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use backup_server::config::Config;
use backup_server::db::{self, ClientRepository};
use backup_server::routes;
use backup_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "backup_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("invalid configuration")?;

    tracing::info!("Starting Backup Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Backup root: {}", config.storage.backup_root.display());
    tracing::info!("Chunk root: {}", config.storage.chunk_root.display());

    // Initialize database
    let db_pool = db::create_pool(&config.database)
        .await
        .context("failed to initialize database")?;
    tracing::info!("Database initialized at {}", config.database.url);

    let clients = ClientRepository::new(&db_pool);
    for client in &config.bootstrap_clients {
        clients
            .register(&client.client_id, &client.api_key)
            .await
            .with_context(|| format!("failed to register client {}", client.client_id))?;
        tracing::info!(client_id = %client.client_id, "Registered bootstrap client");
    }

    // Create application state
    let app_state = AppState::new(config.clone(), db_pool).await?;

    let cleanup = app_state
        .uploads()
        .start_cleanup_task(Duration::from_secs(config.upload.cleanup_interval_secs));

    let app = routes::app(app_state);

    // Start server with graceful shutdown
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid SERVER_HOST/SERVER_PORT")?;
    tracing::info!("Backup Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cleanup.abort();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
