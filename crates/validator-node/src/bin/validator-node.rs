#![forbid(unsafe_code)]

//! **validator-node** – process entry point.
//!
//! Loads a [`validator_types::NodeConfig`], opens the SQLite state database,
//! and spawns one feed/processor/backfill task triple per configured chain
//! via [`validator_node::Supervisor`]. The chain RPC transport is an external
//! collaborator (spec.md §1) — this binary has no concrete `ChainClient`
//! implementation of its own, so it refuses to start any chain it cannot
//! build a client for rather than silently running with a stub.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use validator_feed::ChainClient;
use validator_node::{load_config, ChainClientFactory, Supervisor};
use validator_store_sqlite::SqliteBackend;
use validator_types::ChainConfig;

#[derive(Parser)]
#[command(name = "validator-node")]
#[command(about = "Replays on-chain table-creation/mutation events into a local relational store")]
#[command(version)]
struct Cli {
    /// Path (without extension) to the node configuration file; the `config`
    /// crate picks the format (TOML, YAML, JSON) from whichever file matches.
    #[arg(long, default_value = "config/node")]
    config: String,
}

/// No deployment has wired a concrete chain RPC transport into this
/// workspace (spec.md §1 excludes it as an external collaborator); this
/// factory exists so `Supervisor`'s API is exercisable, and it fails loudly
/// rather than returning a client that silently does nothing.
struct UnimplementedChainClientFactory;

impl ChainClientFactory for UnimplementedChainClientFactory {
    fn build(&self, chain: &ChainConfig) -> Arc<dyn ChainClient> {
        panic!(
            "no ChainClient transport is wired in for chain {}; supply a \
             validator_feed::ChainClient implementation via a custom \
             ChainClientFactory before running this binary against a real chain",
            chain.chain_id
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).with_context(|| format!("loading config from {}", cli.config))?;

    init_tracing(&config.log_filter);
    info!(version = env!("CARGO_PKG_VERSION"), chains = config.chains.len(), "starting validator-node");

    // Two independent connections to the same database: one for the
    // executor/processor writer, one for the feed writer. They touch
    // disjoint tables (spec.md §3) but run concurrently, so they must not
    // share a pooled connection — see `SqliteBackend`'s type docs.
    let store = Arc::new(
        SqliteBackend::open(&config.database_path)
            .await
            .with_context(|| format!("opening state database at {}", config.database_path))?,
    );
    let feed_store = Arc::new(
        SqliteBackend::open(&config.database_path)
            .await
            .with_context(|| format!("opening feed-writer connection to {}", config.database_path))?,
    );

    let factory = Arc::new(UnimplementedChainClientFactory);
    let supervisor = Supervisor::new(store, feed_store, config, factory);

    let cancel = CancellationToken::new();
    let handles = supervisor.spawn_all(&cancel).await.context("spawning per-chain tasks")?;

    shutdown_signal().await;
    info!("shutdown signal received, cancelling all chain tasks");
    cancel.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "chain task panicked during shutdown");
        }
    }

    info!("validator-node stopped");
    Ok(())
}

fn init_tracing(log_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_filter.to_string()));

    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
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
