//! Per-chain task supervisor.
//!
//! Grounded on `toka-runtime`'s `Runtime` (`tokio::spawn` per long-running
//! concern, `tracing` at every lifecycle event, cooperative shutdown rather
//! than a raw `Drop`-triggered stop) generalized from "one task per agent"
//! to "three tasks per configured chain" (spec.md §5): a feed, a processor,
//! and a block-info backfill loop, coordinated only through two store
//! handles — one per writer, never shared between them (see [`Supervisor`]).

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use validator_executor::Executor;
use validator_feed::{ChainClient, EventFeed, EventTypeFilter, FeedStore};
use validator_processor::EventProcessor;
use validator_store_core::Store;
use validator_types::{ChainConfig, NodeConfig};

/// Builds the [`ChainClient`] a chain's feed talks to. The concrete RPC
/// transport is an external collaborator (spec.md §1) — a real deployment
/// implements this trait against its chain's JSON-RPC endpoint and supplies
/// it to the [`Supervisor`] through this seam; nothing in this workspace
/// implements a transport itself.
pub trait ChainClientFactory: Send + Sync {
    /// Builds (or looks up a pooled) client for `chain`.
    fn build(&self, chain: &ChainConfig) -> Arc<dyn ChainClient>;
}

/// The three tasks spawned for one chain.
struct ChainTasks {
    feed: JoinHandle<()>,
    processor: JoinHandle<()>,
    backfill: JoinHandle<()>,
}

/// Owns the tasks for every chain configured in a [`NodeConfig`]. One
/// `Supervisor` per node process.
///
/// Takes two store handles rather than one: `store` is the
/// `validator-executor`/`validator-processor` writer (registry, acl,
/// controller, user tables, receipts, cursor, state hash) and `feed_store`
/// is the `validator-feed` writer (`system_evm_events`,
/// `system_evm_block_info` only). They must be **separate** connections to
/// the same database — see [`validator_store_sqlite::SqliteBackend`]'s type
/// docs for why sharing one pooled connection between these two concurrent
/// writers is unsafe even though they touch disjoint rows.
pub struct Supervisor {
    store: Arc<dyn Store>,
    feed_store: Arc<dyn FeedStore>,
    node_config: NodeConfig,
    factory: Arc<dyn ChainClientFactory>,
}

impl Supervisor {
    /// Builds a supervisor over `store` (executor/processor writes) and
    /// `feed_store` (feed writes — a distinct connection to the same
    /// database), ready to spawn tasks for every chain in
    /// `node_config.chains`.
    pub fn new(
        store: Arc<dyn Store>,
        feed_store: Arc<dyn FeedStore>,
        node_config: NodeConfig,
        factory: Arc<dyn ChainClientFactory>,
    ) -> Self {
        Self { store, feed_store, node_config, factory }
    }

    /// Spawns every chain's feed/processor/backfill tasks. Cancelling
    /// `cancel` stops all of them cooperatively; call [`Supervisor::join_all`]
    /// afterward to wait for a clean exit.
    pub async fn spawn_all(&self, cancel: &CancellationToken) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::with_capacity(self.node_config.chains.len() * 3);
        for chain in &self.node_config.chains {
            let tasks = self.spawn_chain(chain.clone(), cancel.clone()).await?;
            handles.push(tasks.feed);
            handles.push(tasks.processor);
            handles.push(tasks.backfill);
        }
        Ok(handles)
    }

    async fn spawn_chain(&self, chain: ChainConfig, cancel: CancellationToken) -> anyhow::Result<ChainTasks> {
        let chain_id = chain.chain_id;
        let client = self.factory.build(&chain);
        let executor = Executor::new(self.store.clone(), chain.clone());
        let processor = Arc::new(EventProcessor::new(executor, chain.clone()));
        let feed = Arc::new(EventFeed::new(client, self.feed_store.clone(), chain.clone()));

        let resume_height =
            processor.last_processed_height().await?.map(|h| h + 1).unwrap_or(chain.start_height);

        let (tx, rx) = mpsc::channel(64);

        let feed_task = {
            let feed = feed.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                feed.start(resume_height, EventTypeFilter::core_only(), tx, cancel).await;
            })
        };

        let processor_task = {
            let processor = processor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                processor.run(rx, cancel).await;
            })
        };

        let backfill_task = {
            let feed = feed.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                feed.run_backfill_loop(resume_height, cancel).await;
            })
        };

        info!(chain_id = chain_id.0, resume_height, "spawned feed/processor/backfill tasks");
        Ok(ChainTasks { feed: feed_task, processor: processor_task, backfill: backfill_task })
    }
}
