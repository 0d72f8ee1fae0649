#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **validator-feed** – per-chain, reorg-tolerant, batched log fetcher.
//!
//! Turns a [`ChainClient`] (an external RPC capability the core never
//! implements — Non-goals, spec.md §1) into an ordered, duplicate-free stream
//! of [`BlockEvents`] delivered to a bounded sink, persisting every decoded
//! event into `EventLogStore` along the way. Grounded on the
//! poll/fetch/retry shape of the retrieved `EventHandler` (gnosis-gp-v2
//! `event_handling.rs`): a reorg guard computed from current-head minus a
//! fixed depth, and in-batch deduplication before insertion. ABI decoding
//! uses `alloy-sol-types`' `sol!` macro, the crate the EVM-adjacent repos in
//! the retrieval pack (`megaeth-labs-mega-evm`) already depend on for the
//! same purpose.

use std::cmp::{max, min};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use alloy_primitives::{B256, U256};
use alloy_sol_types::{sol, SolEvent};
use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use validator_store_core::{BlockInfoStore, EventLogStore, StorageError};
use validator_types::{
    Address as VAddress, BlockEvents, BlockNumber, ChainConfig, ChainHealth, ChainId, DecodedEvent,
    EvmEvent, Hash32, Index, Policy, TableId, TxnEvents,
};

//─────────────────────────────
//  Contract ABI (spec.md §6)
//─────────────────────────────

sol! {
    event CreateTable(address indexed owner, uint256 indexed tableId, string statement);

    struct PolicyAbi {
        bool allowInsert;
        bool allowUpdate;
        bool allowDelete;
        string whereClause;
        string withCheck;
        string[] updatableColumns;
    }

    event RunSQL(address indexed caller, bool isOwner, uint256 indexed tableId, string statement, PolicyAbi policy);

    event SetController(address indexed caller, uint256 indexed tableId, address controller);

    event TransferTable(address indexed from, address indexed to, uint256 indexed tableId);

    event Transfer(address indexed from, address indexed to, uint256 amount);
}

//─────────────────────────────
//  ChainClient (the one external seam, spec.md §6)
//─────────────────────────────

/// One raw EVM log as returned by a chain RPC provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    /// Contract address the log was emitted from.
    pub address: VAddress,
    /// Topic hashes, including the event signature in position 0.
    pub topics: Vec<Hash32>,
    /// Non-indexed log payload.
    pub data: Vec<u8>,
    /// Block the log was mined in.
    pub block_number: BlockNumber,
    /// Hash of the block the log was mined in.
    pub block_hash: Hash32,
    /// Transaction that produced this log.
    pub transaction_hash: Hash32,
    /// Position of the transaction within its block.
    pub transaction_index: Index,
    /// Position of this log within its transaction's receipt.
    pub log_index: Index,
}

/// A block header, as much of it as the feed needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Block number.
    pub number: BlockNumber,
    /// Unix-epoch seconds the block was produced at.
    pub timestamp: u64,
}

/// Selects "latest" or a specific height for [`ChainClient::header_by_number`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeightQuery {
    /// The chain's current head.
    Latest,
    /// A specific, already-mined block.
    Number(BlockNumber),
}

/// The single external collaborator `validator-feed` depends on: a capability
/// that can list logs in a block range and fetch a header. No concrete RPC
/// transport is implemented here (spec.md §1 Non-goals) — this is the seam a
/// binary wires a real provider into.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Lists logs emitted by `address` in `[from_block, to_block]` whose
    /// first topic is one of `topics0`. An empty `topics0` means "any event".
    async fn filter_logs(
        &self,
        from_block: BlockNumber,
        to_block: BlockNumber,
        address: VAddress,
        topics0: &[Hash32],
    ) -> Result<Vec<RawLog>, FeedError>;

    /// Fetches a block header.
    async fn header_by_number(&self, which: HeightQuery) -> Result<Header, FeedError>;
}

/// Errors a [`ChainClient`] implementation raises, classified so the feed's
/// adaptive backoff (spec.md §4.1 step 3) can react appropriately.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// The provider rejected the request because the response (or the
    /// requested range) was too large; the feed should shrink its window and
    /// retry the same `from_height`.
    #[error("response too large: {0}")]
    ResponseTooLarge(String),
    /// The provider's archive node no longer has the requested range
    /// available (e.g. a Filecoin-family lookback limit).
    #[error("lookback exceeded: {0}")]
    LookbackExceeded(String),
    /// Any other transport-level failure (timeout, connection reset, 5xx).
    #[error("transport error: {0}")]
    Transport(String),
}

//─────────────────────────────
//  Event type filter
//─────────────────────────────

/// Which contract event types a feed should request and decode. Each flag
/// contributes its signature hash to the `topics0` array passed to
/// [`ChainClient::filter_logs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTypeFilter {
    /// Include `CreateTable`.
    pub create_table: bool,
    /// Include `RunSQL`.
    pub run_sql: bool,
    /// Include `SetController`.
    pub set_controller: bool,
    /// Include `TransferTable`.
    pub transfer_table: bool,
    /// Include the recognized-but-unactioned `Transfer` event.
    pub transfer: bool,
}

impl EventTypeFilter {
    /// All five recognized event types (spec.md §6).
    pub fn all() -> Self {
        Self {
            create_table: true,
            run_sql: true,
            set_controller: true,
            transfer_table: true,
            transfer: true,
        }
    }

    /// Only the four events the `EventProcessor`/`Executor` act on.
    pub fn core_only() -> Self {
        Self { transfer: false, ..Self::all() }
    }

    /// The topic-0 hashes this filter selects for.
    pub fn topic_hashes(&self) -> Vec<Hash32> {
        let mut hashes = Vec::with_capacity(5);
        if self.create_table {
            hashes.push(CreateTable::SIGNATURE_HASH);
        }
        if self.run_sql {
            hashes.push(RunSQL::SIGNATURE_HASH);
        }
        if self.set_controller {
            hashes.push(SetController::SIGNATURE_HASH);
        }
        if self.transfer_table {
            hashes.push(TransferTable::SIGNATURE_HASH);
        }
        if self.transfer {
            hashes.push(Transfer::SIGNATURE_HASH);
        }
        hashes
    }
}

//─────────────────────────────
//  Decoding
//─────────────────────────────

/// A log's first topic did not match a recognized event, or its fields could
/// not be decoded against the event it claimed to be.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// No topic0 present on the log at all.
    #[error("log has no topics")]
    NoTopic0,
    /// The topic0 hash is not one this crate recognizes.
    #[error("unrecognized event signature {0:#x}")]
    UnknownSignature(B256),
    /// The log claimed a known signature but its ABI-encoded fields did not
    /// decode against it.
    #[error("ABI decode failed for {event}: {source}")]
    Abi {
        /// Event type name the log claimed to be.
        event: &'static str,
        /// Underlying decode failure.
        source: alloy_sol_types::Error,
    },
    /// A `tableId` field did not fit in a `u64`.
    #[error("table id {0} does not fit in u64")]
    TableIdOverflow(U256),
}

fn u256_to_table_id(value: U256) -> Result<TableId, DecodeError> {
    u64::try_from(value).map(TableId).map_err(|_| DecodeError::TableIdOverflow(value))
}

/// Decodes one raw log into a tagged [`DecodedEvent`], dispatching on its
/// topic0. This is the only place event ABI knowledge lives; the rest of the
/// crate treats events as opaque, already-tagged values (Design Notes §9).
pub fn decode_log(log: &RawLog) -> Result<DecodedEvent, DecodeError> {
    let topic0 = *log.topics.first().ok_or(DecodeError::NoTopic0)?;
    let topics = log.topics.iter().copied();
    let data = log.data.as_slice();

    if topic0 == CreateTable::SIGNATURE_HASH {
        let ev = CreateTable::decode_raw_log(topics, data, true)
            .map_err(|source| DecodeError::Abi { event: "CreateTable", source })?;
        return Ok(DecodedEvent::CreateTable {
            owner: ev.owner,
            table_id: u256_to_table_id(ev.tableId)?,
            statement: ev.statement,
        });
    }
    if topic0 == RunSQL::SIGNATURE_HASH {
        let ev = RunSQL::decode_raw_log(topics, data, true)
            .map_err(|source| DecodeError::Abi { event: "RunSQL", source })?;
        return Ok(DecodedEvent::RunSql {
            caller: ev.caller,
            is_owner: ev.isOwner,
            table_id: u256_to_table_id(ev.tableId)?,
            statement: ev.statement,
            policy: policy_from_abi(ev.policy),
        });
    }
    if topic0 == SetController::SIGNATURE_HASH {
        let ev = SetController::decode_raw_log(topics, data, true)
            .map_err(|source| DecodeError::Abi { event: "SetController", source })?;
        return Ok(DecodedEvent::SetController {
            caller: ev.caller,
            table_id: u256_to_table_id(ev.tableId)?,
            controller: ev.controller,
        });
    }
    if topic0 == TransferTable::SIGNATURE_HASH {
        let ev = TransferTable::decode_raw_log(topics, data, true)
            .map_err(|source| DecodeError::Abi { event: "TransferTable", source })?;
        return Ok(DecodedEvent::TransferTable {
            from: ev.from,
            to: ev.to,
            table_id: u256_to_table_id(ev.tableId)?,
        });
    }
    if topic0 == Transfer::SIGNATURE_HASH {
        let ev = Transfer::decode_raw_log(topics, data, true)
            .map_err(|source| DecodeError::Abi { event: "Transfer", source })?;
        return Ok(DecodedEvent::Transfer { from: ev.from, to: ev.to, amount: ev.amount });
    }
    Err(DecodeError::UnknownSignature(topic0))
}

/// Empty-string-means-absent, matching the free-text-fragment convention
/// Design Notes §9 uses for `where_clause`/`with_check` (Solidity has no
/// nullable string).
fn policy_from_abi(abi: PolicyAbi) -> Option<Policy> {
    Some(Policy {
        allow_insert: abi.allowInsert,
        allow_update: abi.allowUpdate,
        allow_delete: abi.allowDelete,
        where_clause: (!abi.whereClause.is_empty()).then_some(abi.whereClause),
        updatable_columns: (!abi.updatableColumns.is_empty()).then_some(abi.updatableColumns),
        with_check: (!abi.withCheck.is_empty()).then_some(abi.withCheck),
    })
}

//─────────────────────────────
//  State machine (spec.md §4.1)
//─────────────────────────────

/// The feed's internal state, logged at each transition for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedState {
    Polling,
    Fetching,
    Decoding,
    Persisting,
}

/// Storage surface `EventFeed` needs: the event log it owns exclusively, plus
/// the chain-health record used to surface a lookback skip (spec Design
/// Notes §9 Open Question).
pub trait FeedStore: EventLogStore + BlockInfoStore {}
impl<T: EventLogStore + BlockInfoStore> FeedStore for T {}

/// Per-chain reorg-tolerant log fetcher. One instance per chain; its `start`
/// future is spawned as that chain's dedicated feed task (spec.md §5).
pub struct EventFeed {
    client: Arc<dyn ChainClient>,
    store: Arc<dyn FeedStore>,
    config: ChainConfig,
}

impl EventFeed {
    /// Builds a feed for `config.chain_id`, reading from `client` and
    /// persisting through `store`.
    pub fn new(client: Arc<dyn ChainClient>, store: Arc<dyn FeedStore>, config: ChainConfig) -> Self {
        Self { client, store, config }
    }

    /// Runs the poll/fetch/decode/persist loop, delivering batches to `sink`
    /// until `cancel` fires. Restartable from any `from_height` — persistence
    /// is idempotent (spec.md §4.1 point 6).
    #[instrument(skip(self, sink, cancel), fields(chain_id = self.config.chain_id.0))]
    pub async fn start(
        &self,
        mut from_height: BlockNumber,
        event_filter: EventTypeFilter,
        sink: mpsc::Sender<BlockEvents>,
        cancel: CancellationToken,
    ) {
        let mut window = self.config.max_fetch_window.max(1);
        let topics0 = event_filter.topic_hashes();

        loop {
            if cancel.is_cancelled() {
                info!("feed cancelled, shutting down");
                return;
            }

            let state = FeedState::Polling;
            debug!(?state, from_height, window, "polling chain head");
            let head = match self.client.header_by_number(HeightQuery::Latest).await {
                Ok(h) => h,
                Err(FeedError::Transport(msg)) => {
                    warn!(%msg, "transport error polling head, backing off");
                    self.sleep_or_cancel(self.config.poll_interval, &cancel).await;
                    continue;
                }
                Err(other) => {
                    warn!(%other, "unexpected error polling head, backing off");
                    self.sleep_or_cancel(self.config.poll_interval, &cancel).await;
                    continue;
                }
            };
            let _ = self.record_poll(head).await;

            let final_height = head.number.saturating_sub(self.config.min_chain_depth);
            if from_height > final_height {
                self.sleep_or_cancel(self.config.poll_interval, &cancel).await;
                continue;
            }

            let to_height = min(from_height.saturating_add(window - 1), final_height);
            debug!(state = ?FeedState::Fetching, from_height, to_height, "fetching logs");
            let logs = match self
                .client
                .filter_logs(from_height, to_height, self.config.contract_address, &topics0)
                .await
            {
                Ok(logs) => logs,
                Err(FeedError::ResponseTooLarge(msg)) => {
                    window = max(1, (window as f64 * 0.8) as u64);
                    warn!(%msg, new_window = window, "shrinking fetch window");
                    continue;
                }
                Err(FeedError::LookbackExceeded(msg)) => {
                    self.handle_lookback_exceeded(&mut from_height, head.number, &msg).await;
                    continue;
                }
                Err(FeedError::Transport(msg)) => {
                    warn!(%msg, "transport error fetching logs, retrying");
                    self.sleep_or_cancel(self.config.poll_interval, &cancel).await;
                    continue;
                }
            };

            debug!(state = ?FeedState::Decoding, count = logs.len(), "decoding logs");
            let blocks = match dedup_and_decode(self.config.chain_id, logs) {
                Ok(blocks) => blocks,
                Err(e) => {
                    warn!(error = %e, "decode error, halting batch and retrying");
                    self.sleep_or_cancel(self.config.poll_interval, &cancel).await;
                    continue;
                }
            };

            debug!(state = ?FeedState::Persisting, blocks = blocks.len(), "persisting batch");
            if let Err(e) = self.persist_batch(&blocks).await {
                warn!(error = %e, "persistence error, retrying batch");
                self.sleep_or_cancel(self.config.poll_interval, &cancel).await;
                continue;
            }

            for block in blocks {
                if sink.send(block).await.is_err() {
                    info!("sink closed, feed shutting down");
                    return;
                }
            }

            from_height = to_height + 1;
        }
    }

    async fn sleep_or_cancel(&self, dur: std::time::Duration, cancel: &CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(dur) => {}
            _ = cancel.cancelled() => {}
        }
    }

    async fn record_poll(&self, head: Header) -> Result<(), StorageError> {
        let mut health = self.store.get_chain_health(self.config.chain_id).await?;
        health.last_polled_at = Some(chrono::Utc::now());
        let _ = head;
        self.store.set_chain_health(&health).await
    }

    /// spec.md §4.1 step 3, Filecoin family: fast-forwards past the skipped
    /// range and records it (Design Notes §9 Open Question — surfaced as
    /// queryable `ChainHealth`, not only a log line).
    async fn handle_lookback_exceeded(&self, from_height: &mut BlockNumber, head_number: BlockNumber, msg: &str) {
        if !self.config.lossy_lookback {
            warn!(%msg, "lookback exceeded on a chain not marked lossy_lookback; retrying same range");
            return;
        }
        let skip_to = head_number.saturating_sub(1995);
        let skip_to = max(skip_to, *from_height);
        warn!(%msg, from = *from_height, to = skip_to, "lookback exceeded; fast-forwarding and skipping past events");
        if let Ok(mut health) = self.store.get_chain_health(self.config.chain_id).await {
            health.lookback_skipped_from = Some(*from_height);
            health.lookback_skipped_to = Some(skip_to);
            let _ = self.store.set_chain_health(&health).await;
        }
        *from_height = skip_to;
    }

    async fn persist_batch(&self, blocks: &[BlockEvents]) -> Result<(), StorageError> {
        for block in blocks {
            for txn in &block.txns {
                if self.store.txn_events_persisted(self.config.chain_id, txn.txn_hash).await? {
                    continue;
                }
                self.store.persist_txn_events(self.config.chain_id, txn).await?;
            }
        }
        Ok(())
    }

    /// Background task: fetches timestamps for any block in `[from, to]`
    /// still missing one, bounded to `config.header_fetch_parallelism`
    /// concurrent header fetches (spec.md §4.1 point 7, supplemented per
    /// `SPEC_FULL.md`). Failure is logged and left for the next pass — never
    /// fatal to the feed.
    pub async fn backfill_block_info(&self, from: BlockNumber, to: BlockNumber) {
        let missing = match self.store.blocks_missing_timestamp(self.config.chain_id, from, to).await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "failed to list blocks missing timestamp");
                return;
            }
        };
        if missing.is_empty() {
            return;
        }
        let semaphore = Arc::new(Semaphore::new(self.config.header_fetch_parallelism.max(1)));
        let mut tasks = Vec::with_capacity(missing.len());
        for block_number in missing {
            let semaphore = semaphore.clone();
            let client = self.client.clone();
            tasks.push(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                let result = client.header_by_number(HeightQuery::Number(block_number)).await;
                (block_number, result)
            });
        }
        let headers = futures::future::join_all(tasks).await;
        for (block_number, result) in headers {
            match result {
                Ok(header) => {
                    let ts = chrono::DateTime::from_timestamp(header.timestamp as i64, 0).unwrap_or_else(chrono::Utc::now);
                    if let Err(e) = self.store.set_block_timestamp(self.config.chain_id, header.number, ts).await {
                        warn!(error = %e, block_number = header.number, "failed to persist block timestamp");
                    }
                }
                Err(e) => {
                    warn!(error = %e, block_number, "failed to fetch block header for timestamp backfill");
                }
            }
        }
    }

    /// Drives [`Self::backfill_block_info`] continuously: each pass covers
    /// every block newly reached by the chain head since the previous pass.
    /// Run as its own task alongside `start` (spec.md §4.1 point 7,
    /// supplemented per `SPEC_FULL.md`) — the node supervisor spawns one of
    /// these per chain.
    pub async fn run_backfill_loop(&self, mut from: BlockNumber, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.client.header_by_number(HeightQuery::Latest).await {
                Ok(head) if head.number >= from => {
                    self.backfill_block_info(from, head.number).await;
                    from = head.number + 1;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "failed to poll head for block-info backfill"),
            }
            self.sleep_or_cancel(self.config.poll_interval, &cancel).await;
        }
    }
}

/// Groups a flat batch of logs into ordered [`BlockEvents`], deduplicating by
/// `(block_number, txn_hash, log_index)` within the batch (spec.md §4.1 point
/// 4) before decoding. A decode failure anywhere in the batch aborts the
/// whole batch (point 6's "never silently drop an event").
fn dedup_and_decode(chain_id: ChainId, logs: Vec<RawLog>) -> Result<Vec<BlockEvents>, DecodeError> {
    let mut seen = HashSet::new();
    let mut by_block: BTreeMap<BlockNumber, BTreeMap<Index, (Hash32, Vec<EvmEvent>)>> = BTreeMap::new();

    for log in logs {
        let key = (log.block_number, log.transaction_hash, log.log_index);
        if !seen.insert(key) {
            continue;
        }
        let decoded = decode_log(&log)?;
        let event = EvmEvent {
            chain_id,
            txn_hash: log.transaction_hash,
            log_index: log.log_index,
            txn_index: log.transaction_index,
            block_number: log.block_number,
            block_hash: log.block_hash,
            address: log.address,
            topics: log.topics,
            data: log.data,
            decoded,
        };
        by_block
            .entry(log.block_number)
            .or_default()
            .entry(log.transaction_index)
            .or_insert_with(|| (log.transaction_hash, Vec::new()))
            .1
            .push(event);
    }

    let mut blocks = Vec::with_capacity(by_block.len());
    for (block_number, txns_by_index) in by_block {
        let mut block_hash = Hash32::ZERO;
        let mut txns = Vec::with_capacity(txns_by_index.len());
        for (txn_index, (txn_hash, mut events)) in txns_by_index {
            events.sort_by_key(|e| e.log_index);
            if let Some(first) = events.first() {
                block_hash = first.block_hash;
            }
            txns.push(TxnEvents { txn_hash, txn_index, events });
        }
        blocks.push(BlockEvents { block_number, block_hash, txns });
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use validator_store_sqlite::SqliteBackend;

    fn addr(byte: u8) -> VAddress {
        VAddress::repeat_byte(byte)
    }

    fn create_table_log(block: BlockNumber, txn_index: Index, log_index: Index) -> RawLog {
        let owner = addr(0xaa);
        let table_id = U256::from(7u64);
        let statement = "create table foo_1337 (a int)".to_string();
        let event = CreateTable { owner, tableId: table_id, statement };
        let encoded = alloy_sol_types::SolEvent::encode_log_data(&event);
        RawLog {
            address: addr(0x01),
            topics: encoded.topics().to_vec(),
            data: encoded.data.to_vec(),
            block_number: block,
            block_hash: Hash32::repeat_byte(0x55),
            transaction_hash: Hash32::repeat_byte(txn_index as u8 + 1),
            transaction_index: txn_index,
            log_index,
        }
    }

    #[test]
    fn decode_round_trips_create_table() {
        let log = create_table_log(10, 0, 0);
        let decoded = decode_log(&log).unwrap();
        match decoded {
            DecodedEvent::CreateTable { owner, table_id, statement } => {
                assert_eq!(owner, addr(0xaa));
                assert_eq!(table_id, TableId(7));
                assert_eq!(statement, "create table foo_1337 (a int)");
            }
            other => panic!("expected CreateTable, got {other:?}"),
        }
    }

    #[test]
    fn decode_run_sql_maps_empty_policy_strings_to_none() {
        let event = RunSQL {
            caller: addr(0xbb),
            isOwner: false,
            tableId: U256::from(42u64),
            statement: "update foo_42 set a = 1".to_string(),
            policy: PolicyAbi {
                allowInsert: false,
                allowUpdate: true,
                allowDelete: false,
                whereClause: String::new(),
                withCheck: String::new(),
                updatableColumns: vec![],
            },
        };
        let encoded = SolEvent::encode_log_data(&event);
        let log = RawLog {
            address: addr(0x01),
            topics: encoded.topics().to_vec(),
            data: encoded.data.to_vec(),
            block_number: 5,
            block_hash: Hash32::repeat_byte(0x77),
            transaction_hash: Hash32::repeat_byte(0x01),
            transaction_index: 0,
            log_index: 0,
        };
        let decoded = decode_log(&log).unwrap();
        match decoded {
            DecodedEvent::RunSql { caller, is_owner, table_id, policy, .. } => {
                assert_eq!(caller, addr(0xbb));
                assert!(!is_owner);
                assert_eq!(table_id, TableId(42));
                let policy = policy.expect("policy present");
                assert!(policy.allow_update);
                assert_eq!(policy.where_clause, None);
                assert_eq!(policy.with_check, None);
                assert_eq!(policy.updatable_columns, None);
            }
            other => panic!("expected RunSql, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_unknown_signature() {
        let log = RawLog {
            address: addr(0x01),
            topics: vec![Hash32::repeat_byte(0x99)],
            data: vec![],
            block_number: 1,
            block_hash: Hash32::ZERO,
            transaction_hash: Hash32::ZERO,
            transaction_index: 0,
            log_index: 0,
        };
        assert!(matches!(decode_log(&log), Err(DecodeError::UnknownSignature(_))));
    }

    #[test]
    fn dedup_and_decode_drops_duplicate_logs_in_batch() {
        let log = create_table_log(10, 0, 0);
        let blocks = dedup_and_decode(ChainId(1337), vec![log.clone(), log]).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].txns.len(), 1);
        assert_eq!(blocks[0].txns[0].events.len(), 1);
    }

    #[test]
    fn dedup_and_decode_orders_by_txn_index_then_log_index() {
        let a = create_table_log(10, 1, 0);
        let b = create_table_log(10, 0, 0);
        let blocks = dedup_and_decode(ChainId(1337), vec![a, b]).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].txns.len(), 2);
        assert_eq!(blocks[0].txns[0].txn_index, 0);
        assert_eq!(blocks[0].txns[1].txn_index, 1);
    }

    struct MockClient {
        logs_by_range: StdMutex<Vec<(BlockNumber, BlockNumber, Result<Vec<RawLog>, String>)>>,
        head: BlockNumber,
    }

    #[async_trait]
    impl ChainClient for MockClient {
        async fn filter_logs(
            &self,
            from_block: BlockNumber,
            to_block: BlockNumber,
            _address: VAddress,
            _topics0: &[Hash32],
        ) -> Result<Vec<RawLog>, FeedError> {
            let mut guard = self.logs_by_range.lock().unwrap();
            if let Some(pos) = guard.iter().position(|(f, t, _)| *f == from_block && *t == to_block) {
                let (_, _, result) = guard.remove(pos);
                result.map_err(FeedError::Transport)
            } else {
                Ok(vec![])
            }
        }

        async fn header_by_number(&self, _which: HeightQuery) -> Result<Header, FeedError> {
            Ok(Header { number: self.head, timestamp: 0 })
        }
    }

    #[tokio::test]
    async fn feed_persists_and_forwards_one_batch_then_idles() {
        let backend = Arc::new(SqliteBackend::in_memory().await.unwrap());
        let log = create_table_log(1, 0, 0);
        let client = Arc::new(MockClient {
            logs_by_range: StdMutex::new(vec![(1, 1000, Ok(vec![log]))]),
            head: 1,
        });
        let config = ChainConfig {
            chain_id: ChainId(1337),
            contract_address: addr(0x01),
            start_height: 1,
            min_chain_depth: 0,
            poll_interval: std::time::Duration::from_millis(5),
            max_fetch_window: 1000,
            hash_step: 1,
            max_rows: None,
            block_failed_backoff: std::time::Duration::from_millis(5),
            rpc_timeout: std::time::Duration::from_secs(1),
            header_fetch_parallelism: 2,
            lossy_lookback: false,
        };
        let feed = EventFeed::new(client, backend.clone(), config);
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        let handle = tokio::spawn(async move {
            feed.start(1, EventTypeFilter::all(), tx, cancel_clone).await;
        });

        let received = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("did not receive a batch in time")
            .expect("sink closed unexpectedly");
        assert_eq!(received.block_number, 1);
        assert_eq!(received.txns.len(), 1);

        cancel.cancel();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await;

        assert!(backend.txn_events_persisted(ChainId(1337), received.txns[0].txn_hash).await.unwrap());
    }
}
