//! Replay Proxy Binary Entry Point

use clap::Parser;
use replay_proxy::{load_config, logging::init_logging, run_proxy, Args};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_logging(&config.logging)?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received, stopping proxy server...");
    };

    if let Err(e) = run_proxy(config.proxy, shutdown).await {
        tracing::error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}
