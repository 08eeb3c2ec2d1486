//! Evidence ledger daemon

use anyhow::Context;
use evidence_ledger::{Config, EvidenceLedger};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration: explicit file, else environment
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("loading config from {}", path))?,
        None => Config::from_env().context("loading config from environment")?,
    };

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(service = %config.service_name, "Starting evidence ledger");

    let ledger = EvidenceLedger::open(config)
        .await
        .context("opening evidence ledger")?;

    if ledger.config().sealing.auto_seal_every > 0 {
        tracing::info!(
            every = ledger.config().sealing.auto_seal_every,
            "Automatic sealing enabled"
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scanner = ledger.spawn_scanner(shutdown_rx);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    shutdown_tx.send(true)?;
    if let Some(scanner) = scanner {
        scanner.await?;
    }
    ledger.shutdown().await?;

    Ok(())
}
