//! Tessera Scheduler binary.
//!
//! Polls the engine API for flows and requests runs when triggers fire.

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tessera_scheduler::{HttpRequester, Scheduler, SchedulerConfig, SystemClock};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tessera_scheduler=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    tracing::info!("Starting Tessera Scheduler");

    let config = SchedulerConfig::from_env()?;
    tracing::info!(
        scheduler_id = %config.scheduler_id,
        engine_url = %config.engine_url,
        poll_interval_secs = config.poll_interval.as_secs(),
        "Scheduler configuration loaded"
    );

    let requester = Arc::new(HttpRequester::new(&config.engine_url, config.request_timeout));
    let scheduler = Scheduler::new(requester, Arc::new(SystemClock), &config);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        signal.cancel();
    });

    scheduler.run(shutdown).await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
