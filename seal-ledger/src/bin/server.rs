//! Ledger daemon: runs the auto-commit and reconciler jobs

use seal_ledger::{scheduler::Scheduler, Config, Ledger};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    if std::env::var("LEDGER_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = match std::env::var("LEDGER_CONFIG") {
        Ok(path) => {
            let mut config = Config::from_file(&path)?;
            config.apply_env()?;
            config
        }
        Err(_) => Config::from_env()?,
    };
    tracing::info!(service = %config.service_name, "Starting seal ledger");

    let ledger = Ledger::open(config).await?;
    let stop = CancellationToken::new();
    let scheduler = Scheduler::start(ledger, stop.clone());
    tracing::info!(jobs = scheduler.job_count(), "Scheduler running");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down seal ledger");
    scheduler.shutdown().await;
    Ok(())
}
