#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **validator-store-core** – storage trait abstractions.
//!
//! Defines the boundary between the executor/processor/read path and a
//! concrete storage engine, without committing to one. A driver crate
//! (`validator-store-sqlite` is the one this workspace ships) implements
//! every trait below against a real database; the executor, ACL layer and
//! `EventProcessor` depend only on these traits, never on a driver
//! directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use validator_types::{
    Address, BlockNumber, ChainHealth, ChainId, ColumnDef, Hash32, Policy, Privilege,
    ProcessorCursor, Receipt, StateHash, TableId, TxnEvents,
};

//─────────────────────────────
//  Error taxonomy (spec §7)
//─────────────────────────────

/// Every error a storage operation can raise.
///
/// Variants up to and including [`StorageError::RowCountLimit`] are the
/// user-visible / on-chain class: they become a receipt's `error` string
/// and processing continues with the next transaction. [`StorageError::Sqlite`]
/// renders as `"SQLITE_<code>"` for the same class when the underlying
/// engine itself reports a query-caused failure (constraint violation,
/// type mismatch, undefined column). [`StorageError::Infrastructure`] is the
/// disjoint second class: the processor must not advance its cursor and
/// retries the whole block instead.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No registry row exists for the referenced `(chain_id, table_id)`.
    #[error("TABLE_LOOKUP: no such table {0:?}")]
    TableLookup(TableId),
    /// A table name used a reserved or otherwise invalid prefix.
    #[error("TABLE_PREFIX: {0}")]
    TablePrefix(String),
    /// The caller lacked the privilege the statement required.
    #[error("ACL: {0}")]
    Acl(String),
    /// The table's controller policy rejected the operation outright.
    #[error("POLICY: {0}")]
    Policy(String),
    /// A controller's `with_check` predicate failed after execution.
    #[error("POLICY_WITH_CHECK: {0}")]
    PolicyWithCheck(String),
    /// A controller's `where_clause` could not be applied to the statement.
    #[error("POLICY_APPLY_WHERE_CLAUSE: {0}")]
    PolicyApplyWhereClause(String),
    /// An `INSERT` would push a table's row count past its configured cap.
    #[error("ROW_COUNT_LIMIT: table {0:?} is at its row cap")]
    RowCountLimit(TableId),
    /// The underlying SQL engine rejected the statement for a reason the
    /// query itself caused (constraint violation, type mismatch, …).
    #[error("SQLITE_{0}")]
    Sqlite(String),
    /// Anything not caused by the query content: the database is
    /// unreachable, disk is full, or an internal invariant was violated.
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),
}

impl StorageError {
    /// True for the on-chain / user-visible class (safe to render into a
    /// [`Receipt`] and move on); false for the infrastructure class, which
    /// must abort the block and retry.
    pub fn is_on_chain(&self) -> bool {
        !matches!(self, StorageError::Infrastructure(_))
    }
}

/// Shorthand result alias used throughout the storage trait boundary.
pub type Result<T> = std::result::Result<T, StorageError>;

//─────────────────────────────
//  Registry (Table entity, spec §3)
//─────────────────────────────

/// One row of the `registry` table: a table's owner, name and schema
/// fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRow {
    /// Chain the table lives on.
    pub chain_id: ChainId,
    /// Contract-assigned table id.
    pub table_id: TableId,
    /// Current owning address.
    pub owner: Address,
    /// User-chosen name component.
    pub prefix: String,
    /// Canonical schema fingerprint.
    pub structure_hash: [u8; 32],
    /// Declared, ordered column schema.
    pub columns: Vec<ColumnDef>,
    /// Wall-clock time the table was created, as observed by this
    /// validator (not consensus-relevant; for operator visibility only).
    pub created_at: DateTime<Utc>,
}

/// Read/write access to the table registry.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Inserts a new table. Fails with [`StorageError::Infrastructure`] if a
    /// row for `(chain_id, table_id)` already exists — the executor is
    /// expected to have checked `txn_receipt_exists` already, so this
    /// indicates a bug rather than a reorg.
    async fn insert_table(&self, row: TableRow) -> Result<()>;

    /// Looks up a table by id.
    async fn get_table(&self, chain_id: ChainId, table_id: TableId) -> Result<Option<TableRow>>;

    /// Reassigns a table's owner (the `TransferTable` event).
    async fn set_owner(&self, chain_id: ChainId, table_id: TableId, new_owner: Address) -> Result<()>;
}

//─────────────────────────────
//  ACL (AclGrant entity, spec §3)
//─────────────────────────────

/// Grants a privilege check can consult.
#[async_trait]
pub trait AclStoreBackend: Send + Sync {
    /// Inserts (or extends) a grant. Used both for the default
    /// owner-on-create grant and for `GRANT` statements.
    async fn grant(
        &self,
        chain_id: ChainId,
        table_id: TableId,
        grantee: Address,
        privileges: &[Privilege],
    ) -> Result<()>;

    /// Removes privileges from a grant (a `REVOKE` statement). Removing the
    /// last privilege drops the row entirely.
    async fn revoke(
        &self,
        chain_id: ChainId,
        table_id: TableId,
        grantee: Address,
        privileges: &[Privilege],
    ) -> Result<()>;

    /// The privilege set currently held by `grantee` on `table_id` (empty if
    /// no grant exists).
    async fn privileges_of(
        &self,
        chain_id: ChainId,
        table_id: TableId,
        grantee: Address,
    ) -> Result<Vec<Privilege>>;

    /// Drops every grant for a table — used by `TransferTable` so a new
    /// owner starts with only the implicit owner rights.
    async fn clear_grants(&self, chain_id: ChainId, table_id: TableId) -> Result<()>;
}

//─────────────────────────────
//  Controller (spec §3, §4.3)
//─────────────────────────────

/// Optional policy-contract association for a table.
#[async_trait]
pub trait ControllerStore: Send + Sync {
    /// Sets (or, if `controller` is the zero address, clears) a table's
    /// controller.
    async fn set_controller(&self, chain_id: ChainId, table_id: TableId, controller: Address) -> Result<()>;

    /// The table's current controller, if any.
    async fn get_controller(&self, chain_id: ChainId, table_id: TableId) -> Result<Option<Address>>;
}

//─────────────────────────────
//  Event log (EVMEvent entity, owned by EventFeed)
//─────────────────────────────

/// Append-only log of decoded chain events. Written exclusively by the
/// event feed; read by the processor.
#[async_trait]
pub trait EventLogStore: Send + Sync {
    /// True if any event for `txn_hash` on `chain_id` is already persisted
    /// — the feed's reorg/idempotence check before inserting a batch.
    async fn txn_events_persisted(&self, chain_id: ChainId, txn_hash: Hash32) -> Result<bool>;

    /// Persists every event of a transaction atomically. A no-op (but not
    /// an error) if the transaction was already persisted.
    async fn persist_txn_events(&self, chain_id: ChainId, events: &TxnEvents) -> Result<()>;

    /// Loads all events for one transaction, in log-index order.
    async fn load_txn_events(&self, chain_id: ChainId, txn_hash: Hash32) -> Result<Option<TxnEvents>>;
}

//─────────────────────────────
//  Block info (BlockExtraInfo entity, owned by EventFeed)
//─────────────────────────────

/// Lazily-populated per-block metadata.
#[async_trait]
pub trait BlockInfoStore: Send + Sync {
    /// Records a block's timestamp once fetched.
    async fn set_block_timestamp(
        &self,
        chain_id: ChainId,
        block_number: BlockNumber,
        timestamp: DateTime<Utc>,
    ) -> Result<()>;

    /// Blocks in `[from, to]` (inclusive) that have no recorded timestamp
    /// yet — the backfill task's work queue.
    async fn blocks_missing_timestamp(
        &self,
        chain_id: ChainId,
        from: BlockNumber,
        to: BlockNumber,
    ) -> Result<Vec<BlockNumber>>;

    /// Reads and writes the observability record for a chain's feed health
    /// (last poll time, most recent lookback-exceeded skip).
    async fn get_chain_health(&self, chain_id: ChainId) -> Result<ChainHealth>;

    /// Persists an updated chain-health record.
    async fn set_chain_health(&self, health: &ChainHealth) -> Result<()>;
}

//─────────────────────────────
//  Receipts (spec §3, §7)
//─────────────────────────────

/// Durable, queryable outcome of every executed transaction.
#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Persists receipts for every transaction executed in a block, in one
    /// write.
    async fn save_receipts(&self, receipts: &[Receipt]) -> Result<()>;

    /// True if a receipt already exists for `txn_hash` (the processor's
    /// reorg-dedup check).
    async fn receipt_exists(&self, chain_id: ChainId, txn_hash: Hash32) -> Result<bool>;

    /// Loads the receipt for one transaction, if any.
    async fn get_receipt(&self, chain_id: ChainId, txn_hash: Hash32) -> Result<Option<Receipt>>;
}

//─────────────────────────────
//  Cursor (ProcessorCursor entity)
//─────────────────────────────

/// The highest committed block per chain.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Reads the current cursor; `None` before the first block commits.
    async fn get_cursor(&self, chain_id: ChainId) -> Result<Option<ProcessorCursor>>;

    /// Advances the cursor. Callers must only ever advance it strictly
    /// (never skip, never move backward); the store is not required to
    /// enforce that itself.
    async fn set_cursor(&self, cursor: ProcessorCursor) -> Result<()>;
}

//─────────────────────────────
//  State hash (spec §4.5)
//─────────────────────────────

/// Persisted per-chain state digests.
#[async_trait]
pub trait StateHashStore: Send + Sync {
    /// Records a freshly computed state hash.
    async fn save_state_hash(&self, hash: &StateHash) -> Result<()>;

    /// The most recently recorded state hash for a chain, if any.
    async fn latest_state_hash(&self, chain_id: ChainId) -> Result<Option<StateHash>>;
}

//─────────────────────────────
//  Raw SQL execution (spec §4.3)
//─────────────────────────────

/// The executor's handle onto the physical store: running admitted DDL/DML
/// text and checking row counts before an `INSERT` commits. Deliberately
/// narrow — the executor never issues anything `validator-sql` did not
/// already admit and rewrite.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Executes an admitted, physical-name `CREATE TABLE` statement.
    async fn execute_ddl(&self, sql: &str) -> Result<()>;

    /// Executes an admitted, physical-name `INSERT`/`UPDATE`/`DELETE` and
    /// returns the number of rows it affected.
    async fn execute_dml(&self, sql: &str) -> Result<u64>;

    /// Current row count of a physical table, consulted against a table's
    /// configured `max_rows` before an `INSERT` is allowed to commit.
    async fn row_count(&self, physical_table: &str) -> Result<u64>;

    /// Executes an admitted DML statement carrying a `RETURNING rowid`
    /// clause (added by [`validator_sql`]'s `add_returning_clause`) and
    /// returns the affected rowids — the set a controller's `with_check`
    /// predicate must be re-checked against.
    async fn execute_dml_returning_rowids(&self, sql: &str) -> Result<Vec<i64>>;
}

//─────────────────────────────
//  Savepoints (spec §4.3 — the executor's atomic per-event scope)
//─────────────────────────────

/// Nested units of work on the single writer connection. `CreateTable`
/// wraps its registry insert, default grant and physical `CREATE TABLE` in
/// one savepoint so a failure partway through leaves no trace; `RunSQL`
/// opens one per event for the same reason. Savepoints may nest (a
/// `BlockScope` could, in principle, wrap its whole block in an outer one),
/// which is why these are named rather than a single begin/commit pair.
#[async_trait]
pub trait Transactional: Send + Sync {
    /// Opens a new savepoint named `name`.
    async fn begin_savepoint(&self, name: &str) -> Result<()>;

    /// Releases (keeps) everything written since `begin_savepoint(name)`.
    async fn release_savepoint(&self, name: &str) -> Result<()>;

    /// Discards everything written since `begin_savepoint(name)`.
    async fn rollback_savepoint(&self, name: &str) -> Result<()>;
}

//─────────────────────────────
//  State hash computation (spec §4.5)
//─────────────────────────────

/// Computes (as opposed to merely persisting) a chain's canonical state
/// digest. Separate from [`StateHashStore`] because computing the hash
/// requires reading every user table, not just the `system_state_hash`
/// catalog row.
#[async_trait]
pub trait StateComputer: Send + Sync {
    /// Recomputes the canonical state hash for `chain_id` as of
    /// `block_number` by walking the registry, ACL, controller and every
    /// user table in primary-key order.
    async fn compute_state_hash(&self, chain_id: ChainId, block_number: BlockNumber) -> Result<StateHash>;
}

//─────────────────────────────
//  Aggregate store handle
//─────────────────────────────

/// A driver implements every trait above plus this marker so the executor
/// can take a single `Arc<dyn Store>` rather than threading ten separate
/// trait objects through its constructors.
pub trait Store:
    RegistryStore
    + AclStoreBackend
    + ControllerStore
    + EventLogStore
    + BlockInfoStore
    + ReceiptStore
    + CursorStore
    + StateHashStore
    + SqlExecutor
    + StateComputer
    + Transactional
{
}

impl<T> Store for T where
    T: RegistryStore
        + AclStoreBackend
        + ControllerStore
        + EventLogStore
        + BlockInfoStore
        + ReceiptStore
        + CursorStore
        + StateHashStore
        + SqlExecutor
        + StateComputer
        + Transactional
{
}

/// Controller policy lookup, kept separate from [`ControllerStore`] because
/// the policy itself travels inside the `RunSQL` event payload rather than
/// being fetched from storage (Design Notes §9) — this trait exists only so
/// tests can stub a policy source without a full event decode.
pub trait PolicySource {
    /// The policy in effect for `table_id`, if its controller supplied one.
    fn policy_for(&self, table_id: TableId) -> Option<Policy>;
}

/// Prelude re-exporting the trait boundary for a driver crate's `use`.
pub mod prelude {
    pub use crate::{
        AclStoreBackend, BlockInfoStore, ControllerStore, CursorStore, EventLogStore, PolicySource,
        ReceiptStore, RegistryStore, Result, SqlExecutor, StateComputer, StateHashStore, Store,
        StorageError, TableRow, Transactional,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_classifies_on_chain_vs_infra() {
        assert!(StorageError::Acl("not enough privileges".into()).is_on_chain());
        assert!(StorageError::RowCountLimit(TableId(1)).is_on_chain());
        assert!(!StorageError::Infrastructure("disk full".into()).is_on_chain());
    }

    #[test]
    fn storage_error_renders_stable_codes() {
        assert_eq!(
            StorageError::Sqlite("CONSTRAINT".into()).to_string(),
            "SQLITE_CONSTRAINT"
        );
        assert_eq!(
            StorageError::TableLookup(TableId(9)).to_string(),
            "TABLE_LOOKUP: no such table TableId(9)"
        );
    }
}
