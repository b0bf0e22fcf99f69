//! Teambook API server binary.

use std::net::SocketAddr;
use teambook_api::{router, AppState};
use teambook_core::TeambookConfig;
use teambook_kernel::Kernel;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = TeambookConfig::from_env();
    let kernel = Kernel::bootstrap(config).await;
    let state = AppState::new(kernel);

    let host = std::env::var("TEAMBOOK_HTTP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("TEAMBOOK_HTTP_PORT")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(8130);
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "teambook api listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}
