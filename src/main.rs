use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use faultline::registry::SimulationRegistry;
use faultline::{control, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting fault-injection proxy...");

    let config = Config::from_env()?;
    info!(
        listen = %format!("{}:{}", config.listen_host, config.listen_port),
        target = %format!("{}:{}", config.target_host, config.target_port),
        control_port = config.control_port,
        "Configuration loaded"
    );

    let registry = Arc::new(SimulationRegistry::new(config.proxy_settings()));

    let bind_addr = format!("127.0.0.1:{}", config.control_port);
    let listener = TcpListener::bind(&bind_addr).await?;

    control::serve(Arc::clone(&registry), listener, shutdown_signal()).await;

    // Tear down whatever simulations are still live before exiting.
    registry.clean_up_all().await;
    info!("Shutdown complete");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
