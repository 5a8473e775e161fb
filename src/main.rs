//! netlog - network health sampler
//!
//! Samples interface counters, latency, DNS and (occasionally) throughput
//! on a fixed cadence and records them in a local SQLite file.

mod config;
mod counters;
mod db;
mod probe;
mod scheduler;
mod throughput;

use config::LoggerConfig;
use db::{Store, TOTAL_IFACE};
use scheduler::Scheduler;

use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("netlog=info".parse()?))
        .init();

    // Load configuration
    let cfg = LoggerConfig::load();
    tracing::info!(
        "Starting netlog on host {} (ping {} x{})",
        cfg.host_label,
        cfg.ping_target,
        cfg.ping_count
    );
    if !cfg.dns_enabled() {
        tracing::info!("DNS probing disabled");
    }
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Store::new(&cfg.db_path)?;
    match store.latest_sample(TOTAL_IFACE)? {
        Some(last) => tracing::info!(
            "Database holds {} rows, last sample at {}",
            store.count_samples()?,
            last.time.format("%Y-%m-%d %H:%M:%S")
        ),
        None => tracing::info!("Database initialized successfully"),
    }

    let (stop_tx, stop_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown requested, finishing current interval");
        let _ = stop_tx.send(());
    });

    let scheduler = Scheduler::from_config(&cfg, store);
    if let Err(e) = scheduler.run(stop_rx).await {
        tracing::error!("Datastore failure, exiting: {}", e);
        return Err(e.into());
    }

    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
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
}
