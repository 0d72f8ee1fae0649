#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **validator-types** – Shared primitive data structures for the chain
//! validator.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that every other crate can depend on it without causing cycles.
//! It intentionally makes no assumptions about I/O, SQL parsing, or storage
//! engines — those live in `validator-sql` and `validator-store-*`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

//─────────────────────────────
//  Core identifiers
//─────────────────────────────

/// EVM chain id (e.g. `1` for mainnet, `1337` for a local devnet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-chain, monotonically-assigned table identifier (mirrors the
/// contract's own `tableId` counter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(pub u64);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A 20-byte EVM account or contract address.
pub type Address = alloy_primitives::Address;

/// A 32-byte transaction or block hash.
pub type Hash32 = alloy_primitives::B256;

/// Block height. Never negative; EVM block numbers fit comfortably in a
/// `u64` for the lifetime of any chain this validator targets.
pub type BlockNumber = u64;

/// Index of a transaction within a block, or of a log within a transaction.
pub type Index = u32;

//─────────────────────────────
//  Column types (spec.md §6)
//─────────────────────────────

/// The deterministic column-type subset a validated `CREATE TABLE` may use.
///
/// Anything not in this list (XML, money, geometry, jsonb, arrays, or any
/// user-defined type) is rejected by `validator-sql` at parse time, before
/// it ever reaches the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum ColumnType {
    Int,
    Int2,
    Int4,
    Int8,
    Serial,
    Serial2,
    Serial4,
    Serial8,
    Text,
    Varchar,
    Bpchar,
    Bool,
    Float4,
    Float8,
    Numeric,
    Date,
    Timestamp,
    Timestamptz,
    Uuid,
    Json,
}

impl ColumnType {
    /// Canonical lowercase name used both when rendering `structure_hash`
    /// input and when matching a parsed column-type token.
    pub fn canonical_name(self) -> &'static str {
        match self {
            ColumnType::Int => "int",
            ColumnType::Int2 => "int2",
            ColumnType::Int4 => "int4",
            ColumnType::Int8 => "int8",
            ColumnType::Serial => "serial",
            ColumnType::Serial2 => "serial2",
            ColumnType::Serial4 => "serial4",
            ColumnType::Serial8 => "serial8",
            ColumnType::Text => "text",
            ColumnType::Varchar => "varchar",
            ColumnType::Bpchar => "bpchar",
            ColumnType::Bool => "bool",
            ColumnType::Float4 => "float4",
            ColumnType::Float8 => "float8",
            ColumnType::Numeric => "numeric",
            ColumnType::Date => "date",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Timestamptz => "timestamptz",
            ColumnType::Uuid => "uuid",
            ColumnType::Json => "json",
        }
    }
}

/// One `(name, type)` pair of a table's ordered schema, as fed into the
/// `structure_hash` computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name, in declaration order.
    pub name: String,
    /// Accepted, canonicalized column type.
    pub col_type: ColumnType,
}

//─────────────────────────────
//  ACL privileges
//─────────────────────────────

/// A single mutating privilege a grantee may hold on a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Privilege {
    /// `INSERT`
    Insert,
    /// `UPDATE`
    Update,
    /// `DELETE`
    Delete,
}

impl Privilege {
    /// Single-character abbreviation used in the `system_acl.privileges`
    /// column (`a`/`w`/`d`), per spec.md §6.
    pub fn abbrev(self) -> char {
        match self {
            Privilege::Insert => 'a',
            Privilege::Update => 'w',
            Privilege::Delete => 'd',
        }
    }

    /// Parse a single abbreviation character back into a [`Privilege`].
    pub fn from_abbrev(c: char) -> Option<Self> {
        match c {
            'a' => Some(Privilege::Insert),
            'w' => Some(Privilege::Update),
            'd' => Some(Privilege::Delete),
            _ => None,
        }
    }
}

//─────────────────────────────
//  Controller policy (spec.md §4.3, §6)
//─────────────────────────────

/// The policy value embedded in a `RunSQL` event when the target table has
/// a controller. Fetched by the contract at emission time — the executor
/// never calls back into the controller itself (Design Notes §9).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Whether `INSERT` statements are allowed.
    pub allow_insert: bool,
    /// Whether `UPDATE` statements are allowed.
    pub allow_update: bool,
    /// Whether `DELETE` statements are allowed.
    pub allow_delete: bool,
    /// Extra `WHERE` fragment AND-combined onto every statement.
    pub where_clause: Option<String>,
    /// Columns an `UPDATE` may touch; `None` means no restriction.
    pub updatable_columns: Option<Vec<String>>,
    /// Predicate that every affected row must satisfy after execution.
    pub with_check: Option<String>,
}

//─────────────────────────────
//  Decoded contract events (spec.md §6)
//─────────────────────────────

/// One decoded, tagged contract event. The executor dispatches on this
/// exhaustively — there is no reflection-based or plugin dispatch (Design
/// Notes §9).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DecodedEvent {
    /// A new table was declared on-chain.
    CreateTable {
        /// Address that will own the table.
        owner: Address,
        /// Contract-assigned table id.
        table_id: TableId,
        /// Raw `CREATE TABLE ...` statement text.
        statement: String,
    },
    /// A mutating (or grant/revoke) statement was submitted against an
    /// existing table.
    RunSql {
        /// Address submitting the statement.
        caller: Address,
        /// Whether the contract considered `caller` the table owner.
        is_owner: bool,
        /// Target table id.
        table_id: TableId,
        /// Raw multi-statement SQL text.
        statement: String,
        /// Controller policy in effect, if any.
        policy: Option<Policy>,
    },
    /// A table's controller was set or cleared.
    SetController {
        /// Address making the change (must be the owner).
        caller: Address,
        /// Target table id.
        table_id: TableId,
        /// New controller address; the zero address means "clear".
        controller: Address,
    },
    /// A table's ownership was reassigned.
    TransferTable {
        /// Previous owner.
        from: Address,
        /// New owner.
        to: Address,
        /// Target table id.
        table_id: TableId,
    },
    /// An ERC-20-style transfer, recognized but not acted on by the core
    /// (retained for downstream consumers that subscribe to the raw feed).
    Transfer {
        /// Sender.
        from: Address,
        /// Recipient.
        to: Address,
        /// Raw (unscaled) amount.
        amount: alloy_primitives::U256,
    },
}

impl DecodedEvent {
    /// The event-type name as it appears in `system_evm_events.event_type`.
    pub fn type_name(&self) -> &'static str {
        match self {
            DecodedEvent::CreateTable { .. } => "CreateTable",
            DecodedEvent::RunSql { .. } => "RunSQL",
            DecodedEvent::SetController { .. } => "SetController",
            DecodedEvent::TransferTable { .. } => "TransferTable",
            DecodedEvent::Transfer { .. } => "Transfer",
        }
    }

    /// The table this event concerns, if any (`Transfer` events target no
    /// table).
    pub fn table_id(&self) -> Option<TableId> {
        match self {
            DecodedEvent::CreateTable { table_id, .. }
            | DecodedEvent::RunSql { table_id, .. }
            | DecodedEvent::SetController { table_id, .. }
            | DecodedEvent::TransferTable { table_id, .. } => Some(*table_id),
            DecodedEvent::Transfer { .. } => None,
        }
    }
}

/// A decoded event together with the raw log coordinates it was derived
/// from. Persisted verbatim into `system_evm_events`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmEvent {
    /// Chain the event was observed on.
    pub chain_id: ChainId,
    /// Transaction that emitted the event.
    pub txn_hash: Hash32,
    /// Position of the originating log within the transaction's receipt.
    pub log_index: Index,
    /// Position of the transaction within its block.
    pub txn_index: Index,
    /// Block the transaction was mined in.
    pub block_number: BlockNumber,
    /// Hash of the block the transaction was mined in.
    pub block_hash: Hash32,
    /// Contract address that emitted the log.
    pub address: Address,
    /// Raw topic hashes, including the event signature topic.
    pub topics: Vec<Hash32>,
    /// Raw non-indexed log data.
    pub data: Vec<u8>,
    /// The decoded, tagged event payload.
    pub decoded: DecodedEvent,
}

/// All events emitted by a single EVM transaction, in log-index order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnEvents {
    /// Transaction hash.
    pub txn_hash: Hash32,
    /// Index of this transaction within its block.
    pub txn_index: Index,
    /// Events emitted by this transaction, ordered by log index.
    pub events: Vec<EvmEvent>,
}

/// All [`TxnEvents`] in one block, ordered by transaction index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEvents {
    /// Block number.
    pub block_number: BlockNumber,
    /// Block hash (used for receipt bookkeeping, not consensus checks).
    pub block_hash: Hash32,
    /// Transactions carrying at least one relevant event, in order.
    pub txns: Vec<TxnEvents>,
}

//─────────────────────────────
//  Receipts and cursors (spec.md §3, §7)
//─────────────────────────────

/// The durable outcome of executing one transaction's worth of events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Chain the transaction was executed on.
    pub chain_id: ChainId,
    /// Transaction hash this receipt covers.
    pub txn_hash: Hash32,
    /// Block the transaction was executed in.
    pub block_number: BlockNumber,
    /// Position of the transaction within its block.
    pub index_in_block: Index,
    /// Table the transaction concerned, if any event named one.
    pub table_id: Option<TableId>,
    /// `Some("<CODE>: <message>")` if execution failed; `None` on success.
    pub error: Option<String>,
}

/// The highest block whose events are fully committed for a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorCursor {
    /// Chain this cursor tracks.
    pub chain_id: ChainId,
    /// Highest committed block number.
    pub block_number: BlockNumber,
}

/// Canonical per-chain state digest at a given block height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateHash {
    /// Chain the digest covers.
    pub chain_id: ChainId,
    /// Block height the digest was computed at.
    pub block_number: BlockNumber,
    /// 32-byte SHA-256 digest of the canonical encoding (spec.md §4.5).
    pub hash: [u8; 32],
}

//─────────────────────────────
//  Chain health (supplemented: Design Notes §9 open question)
//─────────────────────────────

/// Observability record for chain families (e.g. Filecoin) whose archive
/// nodes can fall out of lookback range. Surfaces the otherwise-silent
/// event skip from spec.md §4.1 step 3 as queryable state rather than only
/// a log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHealth {
    /// Chain this record describes.
    pub chain_id: ChainId,
    /// Last time the feed successfully polled the chain head.
    pub last_polled_at: Option<DateTime<Utc>>,
    /// Start of the most recent lookback-exceeded skip, if one occurred.
    pub lookback_skipped_from: Option<BlockNumber>,
    /// End (exclusive) of the most recent lookback-exceeded skip.
    pub lookback_skipped_to: Option<BlockNumber>,
}

impl ChainHealth {
    /// A fresh, healthy record for a chain that has never been skipped.
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            last_polled_at: None,
            lookback_skipped_from: None,
            lookback_skipped_to: None,
        }
    }
}

//─────────────────────────────
//  Configuration (ambient stack)
//─────────────────────────────

/// Per-chain configuration, loaded by `validator-node` and threaded through
/// the feed, executor and processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Chain this configuration applies to.
    pub chain_id: ChainId,
    /// Contract address events are filtered by.
    pub contract_address: Address,
    /// Height to start replaying from on first boot.
    pub start_height: BlockNumber,
    /// Blocks of depth required before a block is treated as final.
    pub min_chain_depth: u64,
    /// How often to poll the chain head.
    #[serde(with = "humantime_serde_secs")]
    pub poll_interval: std::time::Duration,
    /// Initial log-filter window size, in blocks.
    pub max_fetch_window: u64,
    /// Block-number cadence at which a new `StateHash` is published.
    pub hash_step: u64,
    /// Optional hard cap on a table's row count; `None` means unlimited.
    pub max_rows: Option<u64>,
    /// Sleep duration between retries of an infrastructure-failed block.
    #[serde(with = "humantime_serde_secs")]
    pub block_failed_backoff: std::time::Duration,
    /// Timeout applied to each outgoing chain RPC call.
    #[serde(with = "humantime_serde_secs")]
    pub rpc_timeout: std::time::Duration,
    /// Bounded parallelism for the block-timestamp backfill task.
    pub header_fetch_parallelism: usize,
    /// Whether this chain family is known to have an unreliable archive
    /// lookback window (e.g. Filecoin) and should fast-forward rather than
    /// retry indefinitely when the provider reports it.
    pub lossy_lookback: bool,
}

/// Top-level node configuration: tracing, storage location, and the set of
/// chains to replicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Path to the SQLite database file (or `:memory:` for ephemeral runs).
    pub database_path: String,
    /// `tracing-subscriber` env-filter directive, e.g. `"info"`.
    pub log_filter: String,
    /// One entry per chain this node replicates.
    pub chains: Vec<ChainConfig>,
}

/// Serializes/deserializes a [`std::time::Duration`] as whole seconds, so
/// config files stay plain TOML integers instead of nested structs.
mod humantime_serde_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privilege_abbrev_round_trips() {
        for p in [Privilege::Insert, Privilege::Update, Privilege::Delete] {
            assert_eq!(Privilege::from_abbrev(p.abbrev()), Some(p));
        }
        assert_eq!(Privilege::from_abbrev('x'), None);
    }

    #[test]
    fn decoded_event_table_id() {
        let ev = DecodedEvent::Transfer {
            from: Address::ZERO,
            to: Address::ZERO,
            amount: alloy_primitives::U256::from(1u64),
        };
        assert_eq!(ev.table_id(), None);
        assert_eq!(ev.type_name(), "Transfer");
    }

    #[test]
    fn chain_config_round_trips_through_json() {
        let cfg = ChainConfig {
            chain_id: ChainId(1337),
            contract_address: Address::ZERO,
            start_height: 0,
            min_chain_depth: 5,
            poll_interval: std::time::Duration::from_secs(2),
            max_fetch_window: 100_000,
            hash_step: 240,
            max_rows: Some(500_000),
            block_failed_backoff: std::time::Duration::from_secs(10),
            rpc_timeout: std::time::Duration::from_secs(10),
            header_fetch_parallelism: 10,
            lossy_lookback: false,
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ChainConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn chain_health_starts_clean() {
        let h = ChainHealth::new(ChainId(1));
        assert!(h.lookback_skipped_from.is_none());
    }
}
