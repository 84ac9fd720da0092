//! paged-kv-sync: KV cache sync driver for a cache-storage process.
//!
//! Connects to an inference process over the configured KV link and serves
//! its retrieve/store batches from an in-memory prefix store until interrupted.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use paged_kv_sync::config::{Cli, Config};
use paged_kv_sync::sync::{InMemoryKvStore, SyncDriver};
use paged_kv_sync::transfer::topology::Topology;
use paged_kv_sync::transfer::TransportChannel;

/// Pending non-blocking stores the in-memory store buffers.
const STORE_QUEUE_DEPTH: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "paged_kv_sync=debug"
    } else {
        "paged_kv_sync=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("paged-kv-sync v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(rank) = cli.rank {
        config.transport.rank = rank;
    }

    info!(
        layers = ?(config.model.start_layer..config.model.end_layer),
        num_heads = config.model.num_heads,
        head_size = config.model.head_size,
        kv_bytes_per_token = config.model.kv_bytes_per_token(),
        "Configuration loaded"
    );

    // Resolve peers and open the KV link.
    let topology = Topology::resolve(&config.transport)?;
    info!(
        rank = topology.rank,
        world_size = topology.world_size,
        link_group = %topology.link.host.name,
        sub_groups = topology.sub_groups.len(),
        "Topology resolved"
    );
    let channel = TransportChannel::establish(&topology).await?;

    let store = Arc::new(InMemoryKvStore::new(STORE_QUEUE_DEPTH));
    let mut driver = SyncDriver::new(
        config.model.clone(),
        config.driver.device,
        channel,
        store.clone(),
    )?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal, running until the peer hangs up");
            std::future::pending::<()>().await;
        }
    };

    let result = driver.run(shutdown, config.driver.phase_timeout()).await;
    store.flush().await?;

    let stats = store.stats().await;
    info!(
        entries = stats.entries,
        hits = stats.hits,
        retrievals = stats.retrievals,
        bytes_sent = driver.channel().stats().bytes_sent,
        bytes_received = driver.channel().stats().bytes_received,
        "Store summary"
    );

    let driver_stats = result?;
    info!(
        retrieve_phases = driver_stats.retrieve_phases,
        store_phases = driver_stats.store_phases,
        requests_hit = driver_stats.requests_hit,
        stores_dropped = driver_stats.stores_dropped,
        "Shutting down"
    );
    Ok(())
}
