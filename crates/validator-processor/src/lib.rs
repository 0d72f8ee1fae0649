#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **validator-processor** – drives one chain's feed against its executor.
//!
//! Takes delivered [`BlockEvents`] off a channel, opens one
//! `validator_executor::BlockScope` per block, executes every not-yet-seen
//! transaction in order, saves receipts, advances the cursor and (at the
//! configured cadence) publishes a state hash. An infrastructure failure
//! retries the same block indefinitely with a fixed backoff rather than
//! advancing past it — the cursor only ever moves one committed block at a
//! time (spec.md §4.4). Grounded on the supervising loop shape of
//! `toka-runtime/src/runtime/mod.rs` (`tokio::spawn`, `tracing`-driven
//! `match`-on-channel-result loop, graceful shutdown via a cancellation
//! signal rather than a raw `Drop`/kill).

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use validator_executor::Executor;
use validator_store_core::StorageError;
use validator_types::{BlockEvents, BlockNumber, ChainConfig, ChainId, Receipt};

/// Drives a single chain's executor from a stream of delivered blocks.
///
/// The `EventProcessor` is the only writer for its chain (spec.md §4.4's
/// concurrency invariant); exactly one instance is spawned per configured
/// chain by the node supervisor.
pub struct EventProcessor {
    executor: Executor,
    config: ChainConfig,
    stuck_attempts: AtomicU64,
}

impl EventProcessor {
    /// Builds a processor for `config.chain_id`, writing through `executor`.
    pub fn new(executor: Executor, config: ChainConfig) -> Self {
        Self { executor, config, stuck_attempts: AtomicU64::new(0) }
    }

    /// The chain this processor commits blocks for.
    pub fn chain_id(&self) -> ChainId {
        self.config.chain_id
    }

    /// The highest block number already committed, or `None` before the
    /// first commit. Used by the node supervisor to resume an `EventFeed`
    /// from the right height after a restart.
    pub async fn last_processed_height(&self) -> Result<Option<BlockNumber>, StorageError> {
        self.executor.last_processed_height().await
    }

    /// Number of times this processor has retried a block after an
    /// infrastructure failure. Monotonically increasing; exposed for
    /// operational dashboards, not used for any control-flow decision.
    pub fn stuck_attempts(&self) -> u64 {
        self.stuck_attempts.load(Ordering::Relaxed)
    }

    /// Consumes delivered blocks from `blocks` until the channel closes or
    /// `cancel` fires. Each block is retried indefinitely on infrastructure
    /// failure before the loop advances to the next one.
    #[instrument(skip(self, blocks, cancel), fields(chain_id = self.config.chain_id.0))]
    pub async fn run(&self, mut blocks: mpsc::Receiver<BlockEvents>, cancel: CancellationToken) {
        loop {
            let block = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("processor cancelled, shutting down");
                    return;
                }
                received = blocks.recv() => match received {
                    Some(block) => block,
                    None => {
                        info!("feed channel closed, processor shutting down");
                        return;
                    }
                },
            };

            if !self.commit_block_with_retry(&block, &cancel).await {
                return;
            }
        }
    }

    /// Commits one block, retrying on infrastructure failure until it
    /// succeeds or `cancel` fires. Returns `false` if cancellation cut the
    /// retry loop short.
    async fn commit_block_with_retry(&self, block: &BlockEvents, cancel: &CancellationToken) -> bool {
        loop {
            match self.commit_block(block).await {
                Ok(()) => return true,
                Err(e) => {
                    let attempts = self.stuck_attempts.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        error = %e,
                        block_number = block.block_number,
                        attempts,
                        "failed to commit block, retrying after backoff"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.block_failed_backoff) => {}
                        _ = cancel.cancelled() => return false,
                    }
                }
            }
        }
    }

    /// Executes every not-yet-seen transaction in `block`, saves receipts,
    /// advances the cursor and publishes a state hash at the configured
    /// cadence. On-chain failures (ACL denial, policy rejection, bad SQL)
    /// are captured in the transaction's own receipt and never retried —
    /// only a `StorageError` (infrastructure) aborts the whole block.
    async fn commit_block(&self, block: &BlockEvents) -> Result<(), StorageError> {
        let scope = self.executor.open_block(block.block_number);
        let mut receipts = Vec::with_capacity(block.txns.len());

        for txn in &block.txns {
            if scope.txn_receipt_exists(txn.txn_hash).await? {
                debug!(txn_hash = %txn.txn_hash, "receipt already exists, skipping (reorg-safe restart)");
                continue;
            }
            let result = scope.execute_txn_events(txn).await?;
            receipts.push(Receipt {
                chain_id: self.config.chain_id,
                txn_hash: txn.txn_hash,
                block_number: block.block_number,
                index_in_block: txn.txn_index,
                table_id: result.table_id,
                error: result.error,
            });
        }

        if !receipts.is_empty() {
            scope.save_txn_receipts(&receipts).await?;
        }
        scope.set_last_processed_height().await?;

        if self.is_hash_cadence(block.block_number) {
            let hash = scope.state_hash().await?;
            debug!(block_number = block.block_number, hash = %hex::encode(hash.hash), "published state hash");
        }

        Ok(())
    }

    /// True if a state hash is due right after committing `block_number`:
    /// every `hash_step`-th block. `hash_step == 0` disables periodic
    /// hashing entirely.
    fn is_hash_cadence(&self, block_number: BlockNumber) -> bool {
        self.config.hash_step != 0 && block_number % self.config.hash_step == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use validator_store_sqlite::SqliteBackend;
    use validator_types::{Address, DecodedEvent, EvmEvent, Hash32, TableId, TxnEvents};

    fn test_config(hash_step: u64) -> ChainConfig {
        ChainConfig {
            chain_id: ChainId(1337),
            contract_address: Address::ZERO,
            start_height: 0,
            min_chain_depth: 0,
            poll_interval: std::time::Duration::from_millis(10),
            max_fetch_window: 1000,
            hash_step,
            max_rows: None,
            block_failed_backoff: std::time::Duration::from_millis(5),
            rpc_timeout: std::time::Duration::from_secs(1),
            header_fetch_parallelism: 1,
            lossy_lookback: false,
        }
    }

    fn create_table_block(block_number: BlockNumber, owner: Address, table_id: TableId) -> BlockEvents {
        let txn_hash = Hash32::repeat_byte(block_number as u8 + 1);
        BlockEvents {
            block_number,
            block_hash: Hash32::repeat_byte(0xee),
            txns: vec![TxnEvents {
                txn_hash,
                txn_index: 0,
                events: vec![EvmEvent {
                    chain_id: ChainId(1337),
                    txn_hash,
                    log_index: 0,
                    txn_index: 0,
                    block_number,
                    block_hash: Hash32::repeat_byte(0xee),
                    address: Address::ZERO,
                    topics: vec![],
                    data: vec![],
                    decoded: DecodedEvent::CreateTable {
                        owner,
                        table_id,
                        statement: "CREATE TABLE foo_1337 (a int)".to_string(),
                    },
                }],
            }],
        }
    }

    #[tokio::test]
    async fn commits_a_block_and_advances_cursor() {
        let backend = Arc::new(SqliteBackend::in_memory().await.unwrap());
        let executor = Executor::new(backend.clone(), test_config(1));
        let processor = EventProcessor::new(executor, test_config(1));

        let owner: Address = "0x000000000000000000000000000000000000aa".parse().unwrap();
        let block = create_table_block(1, owner, TableId(1));
        processor.commit_block(&block).await.unwrap();

        assert_eq!(processor.last_processed_height().await.unwrap(), Some(1));
        assert_eq!(processor.stuck_attempts(), 0);
    }

    #[tokio::test]
    async fn skips_already_persisted_transactions_on_restart() {
        let backend = Arc::new(SqliteBackend::in_memory().await.unwrap());
        let executor = Executor::new(backend.clone(), test_config(1));
        let processor = EventProcessor::new(executor, test_config(1));

        let owner: Address = "0x000000000000000000000000000000000000bb".parse().unwrap();
        let block = create_table_block(1, owner, TableId(2));
        processor.commit_block(&block).await.unwrap();
        // Re-delivering the same block (as a feed restart would) must not
        // re-execute the already-receipted transaction.
        processor.commit_block(&block).await.unwrap();

        assert_eq!(processor.last_processed_height().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn run_drains_channel_then_exits_on_close() {
        let backend = Arc::new(SqliteBackend::in_memory().await.unwrap());
        let executor = Executor::new(backend, test_config(2));
        let processor = EventProcessor::new(executor, test_config(2));

        let (tx, rx) = mpsc::channel(4);
        let owner: Address = "0x000000000000000000000000000000000000cc".parse().unwrap();
        tx.send(create_table_block(1, owner, TableId(3))).await.unwrap();
        tx.send(create_table_block(2, owner, TableId(4))).await.unwrap();
        drop(tx);

        let cancel = CancellationToken::new();
        processor.run(rx, cancel).await;

        assert_eq!(processor.last_processed_height().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn hash_cadence_fires_every_step_blocks() {
        use validator_store_core::StateHashStore;

        let backend = Arc::new(SqliteBackend::in_memory().await.unwrap());
        let executor = Executor::new(backend.clone(), test_config(2));
        let processor = EventProcessor::new(executor, test_config(2));
        let owner: Address = "0x000000000000000000000000000000000000dd".parse().unwrap();

        processor.commit_block(&create_table_block(1, owner, TableId(5))).await.unwrap();
        assert!(backend.latest_state_hash(ChainId(1337)).await.unwrap().is_none());

        processor.commit_block(&create_table_block(2, owner, TableId(6))).await.unwrap();
        let hash = backend.latest_state_hash(ChainId(1337)).await.unwrap();
        assert_eq!(hash.unwrap().block_number, 2);
    }
}
