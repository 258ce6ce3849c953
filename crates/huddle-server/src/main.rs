use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use huddle_db::Database;
use huddle_server::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env().context("invalid configuration")?;
    let db = Arc::new(Database::open(&config.db_path)?);
    let app = huddle_server::build(&config, db);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Huddle server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Huddle server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
