//! nexdbd: nexdb network daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use nexdb_core::config::NexdbConfig;
use nexdb_transport::TransportPool;
use nexdbd::{bridge, Echo};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = NexdbConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = NexdbConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        NexdbConfig::default()
    });

    let listen = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config.server.listen.clone());
    tracing::info!(listen, "nexdbd starting");

    let pool = Arc::new(
        TransportPool::new(config.transport.clone(), &config.pool)
            .context("failed to start transport pool")?,
    );
    let (inbound, outbound) = pool.workers();
    tracing::info!(
        inbound_workers = inbound,
        outbound_workers = outbound,
        segment_size = config.transport.segment_size,
        max_message_size = config.transport.max_message_size,
        "transport pool ready"
    );

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    let server = tokio::spawn(bridge::serve(listener, pool.clone(), Arc::new(Echo)));

    let circuit_printer = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                tracing::info!(circuits = ?pool.list_circuit_ids(), "circuit table snapshot");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown signal received"),
        r = server                  => tracing::error!("server exited: {:?}", r),
        r = circuit_printer         => tracing::error!("circuit printer exited: {:?}", r),
    }

    Ok(())
}
