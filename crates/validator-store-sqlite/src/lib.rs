#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **validator-store-sqlite** – the SQLite-backed storage driver.
//!
//! Implements every trait in `validator-store-core` against one
//! [`sqlx::SqlitePool`], with every table created `STRICT` so column
//! affinity matches declared types exactly — the engine half of spec §4.3's
//! "bit-identical arithmetic across validators" requirement. A second,
//! read-only handle ([`UserStore`]) shares the same pool but only ever runs
//! `SELECT`s produced by `validator-sql`'s `ReadStmt`.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, SqlitePool};
use validator_store_core::{
    AclStoreBackend, BlockInfoStore, ControllerStore, CursorStore, EventLogStore, ReceiptStore,
    RegistryStore, Result, SqlExecutor, StateComputer, StateHashStore, StorageError, TableRow,
    Transactional,
};
use validator_types::{
    Address, BlockNumber, ChainHealth, ChainId, ColumnDef, ColumnType, Hash32, Privilege,
    ProcessorCursor, Receipt, StateHash, TableId, TxnEvents,
};

fn infra<E: std::fmt::Display>(e: E) -> StorageError {
    StorageError::Infrastructure(e.to_string())
}

/// Renders a 20-byte address as `0x`-prefixed lowercase hex, the textual
/// form every catalog table stores it in.
fn addr_hex(a: Address) -> String {
    format!("{a:#x}")
}

fn parse_addr(s: &str) -> Result<Address> {
    Address::from_str(s).map_err(|e| StorageError::Infrastructure(format!("corrupt address {s}: {e}")))
}

fn hash_hex(h: &[u8; 32]) -> String {
    hex::encode(h)
}

fn parse_hash32(s: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(s).map_err(infra)?;
    bytes
        .try_into()
        .map_err(|_| StorageError::Infrastructure(format!("corrupt hash {s}")))
}

//─────────────────────────────
//  SqliteBackend
//─────────────────────────────

/// A per-database-file writer handle, one pooled connection deep. Each
/// `SqliteBackend` is its own physical connection, so a process that wants
/// both `validator-executor` (writer of the registry/acl/controller/user
/// tables/receipts/cursor/state-hash) and `validator-feed` (writer of
/// `system_evm_events`/`system_evm_block_info` only — spec.md §3's ownership
/// split) must open two `SqliteBackend`s against the same path rather than
/// share one: the two subsystems never touch the same row, but they *do*
/// run concurrently, and a single pooled connection releases mid-savepoint
/// between statements, so a second logical writer sharing that one
/// connection could observe it with an implicit transaction already open
/// ("cannot start a transaction within a transaction"). Separate
/// connections make that impossible by construction; `busy_timeout` absorbs
/// the resulting file-level lock contention between them.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Opens (creating if absent) a SQLite database file and runs the
    /// catalog migration. `path == ":memory:"` is special-cased to a named,
    /// shared-cache in-memory database (`file::memory:?cache=shared`, per
    /// SQLite's own in-memory-database documentation) so that two
    /// independent calls to `open(":memory:")` — one per writer, see the
    /// type docs — see the same data instead of two unrelated empty
    /// databases; callers that want an *isolated* in-memory database (e.g.
    /// one test per case) should use [`SqliteBackend::in_memory`] instead.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let options = if path.to_str() == Some(":memory:") {
            SqliteConnectOptions::from_str("file::memory:?cache=shared").map_err(infra)?
        } else {
            SqliteConnectOptions::new().filename(path).create_if_missing(true)
        }
        .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect_with(options)
            .await
            .map_err(infra)?;
        let backend = Self { pool };
        backend.migrate().await?;
        Ok(backend)
    }

    /// An isolated, private in-memory database — used by tests that each
    /// want a fresh, unshared store. Production code that needs a second
    /// writer against the *same* in-memory database should call
    /// [`SqliteBackend::open`] with `":memory:"` instead, which shares
    /// across calls; this constructor deliberately never shares, so
    /// concurrent test cases in one process never see each other's rows.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(infra)?;
        let backend = Self { pool };
        backend.migrate().await?;
        Ok(backend)
    }

    /// Wraps an already-open pool (used by `UserStore::from_backend` and by
    /// tests that want to share a connection).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        let ddl = [
            "CREATE TABLE IF NOT EXISTS registry (
                chain_id INTEGER NOT NULL,
                id INTEGER NOT NULL,
                controller_owner TEXT NOT NULL,
                prefix TEXT NOT NULL,
                structure_hash TEXT NOT NULL,
                columns_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (chain_id, id)
            ) STRICT",
            "CREATE TABLE IF NOT EXISTS system_acl (
                chain_id INTEGER NOT NULL,
                table_id INTEGER NOT NULL,
                grantee TEXT NOT NULL,
                privileges TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (chain_id, table_id, grantee)
            ) STRICT",
            "CREATE TABLE IF NOT EXISTS system_controller (
                chain_id INTEGER NOT NULL,
                table_id INTEGER NOT NULL,
                controller TEXT NOT NULL,
                PRIMARY KEY (chain_id, table_id)
            ) STRICT",
            "CREATE TABLE IF NOT EXISTS system_evm_events (
                chain_id INTEGER NOT NULL,
                txn_hash TEXT NOT NULL,
                event_index INTEGER NOT NULL,
                address TEXT NOT NULL,
                topics TEXT NOT NULL,
                data BLOB NOT NULL,
                block_number INTEGER NOT NULL,
                tx_index INTEGER NOT NULL,
                block_hash TEXT NOT NULL,
                event_json TEXT NOT NULL,
                event_type TEXT NOT NULL,
                PRIMARY KEY (chain_id, txn_hash, event_index)
            ) STRICT",
            "CREATE TABLE IF NOT EXISTS system_evm_block_info (
                chain_id INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                PRIMARY KEY (chain_id, block_number)
            ) STRICT",
            "CREATE TABLE IF NOT EXISTS system_txn_receipts (
                chain_id INTEGER NOT NULL,
                txn_hash TEXT NOT NULL,
                block_number INTEGER NOT NULL,
                index_in_block INTEGER NOT NULL,
                error TEXT,
                table_id INTEGER,
                PRIMARY KEY (chain_id, txn_hash)
            ) STRICT",
            "CREATE TABLE IF NOT EXISTS system_txn_processor (
                chain_id INTEGER NOT NULL PRIMARY KEY,
                block_number INTEGER NOT NULL
            ) STRICT",
            "CREATE TABLE IF NOT EXISTS system_state_hash (
                chain_id INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                hash TEXT NOT NULL,
                PRIMARY KEY (chain_id, block_number)
            ) STRICT",
            // Supplemented: queryable home for the Filecoin lookback-skip
            // open question (Design Notes §9), not one of the fixed tables
            // spec §6 names.
            "CREATE TABLE IF NOT EXISTS system_chain_health (
                chain_id INTEGER NOT NULL PRIMARY KEY,
                last_polled_at TEXT,
                lookback_skipped_from INTEGER,
                lookback_skipped_to INTEGER
            ) STRICT",
        ];
        for stmt in ddl {
            sqlx::query(stmt).execute(&self.pool).await.map_err(infra)?;
        }
        Ok(())
    }

    /// Executes a validator-produced `CREATE TABLE` statement against the
    /// physical database (the `Executor`'s `CreateTable` handler, after the
    /// registry/ACL rows are inserted in the same savepoint).
    pub async fn execute_ddl(&self, sql: &str) -> Result<()> {
        sqlx::query(sql)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| StorageError::Sqlite(e.to_string()))
    }

    /// Executes a validated, rewritten `INSERT`/`UPDATE`/`DELETE` and
    /// returns the number of affected rows.
    pub async fn execute_dml(&self, sql: &str) -> Result<u64> {
        sqlx::query(sql)
            .execute(&self.pool)
            .await
            .map(|r| r.rows_affected())
            .map_err(|e| StorageError::Sqlite(e.to_string()))
    }

    /// Current row count of a physical table — used by the executor's
    /// `max_rows` enforcement before an `INSERT` commits.
    pub async fn row_count(&self, physical_table: &str) -> Result<u64> {
        let row: (i64,) = sqlx::query_as(&format!("SELECT count(*) FROM {physical_table}"))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        Ok(row.0 as u64)
    }

    /// Runs a read-only query and returns rows rendered as JSON objects —
    /// used by [`UserStore`] and by [`StateHasher`] to enumerate a table's
    /// rows in primary-key order.
    async fn fetch_rows_as_json(&self, sql: &str) -> Result<Vec<serde_json::Value>> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        rows.iter().map(row_to_json).collect()
    }
}

fn row_to_json(row: &SqliteRow) -> Result<serde_json::Value> {
    use serde_json::{Map, Value};
    let mut map = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let value: Value = if let Ok(v) = row.try_get::<i64, _>(i) {
            Value::from(v)
        } else if let Ok(v) = row.try_get::<f64, _>(i) {
            Value::from(v)
        } else if let Ok(v) = row.try_get::<String, _>(i) {
            Value::from(v)
        } else if let Ok(v) = row.try_get::<Vec<u8>, _>(i) {
            Value::from(hex::encode(v))
        } else {
            Value::Null
        };
        map.insert(name, value);
    }
    Ok(Value::Object(map))
}

//─────────────────────────────
//  RegistryStore
//─────────────────────────────

#[async_trait]
impl RegistryStore for SqliteBackend {
    async fn insert_table(&self, row: TableRow) -> Result<()> {
        let columns_json = serde_json::to_string(
            &row.columns
                .iter()
                .map(|c| (c.name.clone(), c.col_type.canonical_name()))
                .collect::<Vec<_>>(),
        )
        .map_err(infra)?;
        sqlx::query(
            "INSERT INTO registry (chain_id, id, controller_owner, prefix, structure_hash, columns_json, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(row.chain_id.0 as i64)
        .bind(row.table_id.0 as i64)
        .bind(addr_hex(row.owner))
        .bind(row.prefix)
        .bind(hash_hex(&row.structure_hash))
        .bind(columns_json)
        .bind(row.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Infrastructure(format!("registry insert: {e}")))?;
        Ok(())
    }

    async fn get_table(&self, chain_id: ChainId, table_id: TableId) -> Result<Option<TableRow>> {
        let row = sqlx::query(
            "SELECT controller_owner, prefix, structure_hash, columns_json, created_at
             FROM registry WHERE chain_id = ? AND id = ?",
        )
        .bind(chain_id.0 as i64)
        .bind(table_id.0 as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(infra)?;
        let Some(row) = row else { return Ok(None) };
        let owner: String = row.try_get("controller_owner").map_err(infra)?;
        let prefix: String = row.try_get("prefix").map_err(infra)?;
        let structure_hash: String = row.try_get("structure_hash").map_err(infra)?;
        let columns_json: String = row.try_get("columns_json").map_err(infra)?;
        let created_at: String = row.try_get("created_at").map_err(infra)?;
        let pairs: Vec<(String, String)> = serde_json::from_str(&columns_json).map_err(infra)?;
        let columns = pairs
            .into_iter()
            .map(|(name, ty)| Ok(ColumnDef { name, col_type: column_type_from_name(&ty)? }))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(TableRow {
            chain_id,
            table_id,
            owner: parse_addr(&owner)?,
            prefix,
            structure_hash: parse_hash32(&structure_hash)?,
            columns,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map_err(infra)?
                .with_timezone(&Utc),
        }))
    }

    async fn set_owner(&self, chain_id: ChainId, table_id: TableId, new_owner: Address) -> Result<()> {
        let affected = sqlx::query("UPDATE registry SET controller_owner = ? WHERE chain_id = ? AND id = ?")
            .bind(addr_hex(new_owner))
            .bind(chain_id.0 as i64)
            .bind(table_id.0 as i64)
            .execute(&self.pool)
            .await
            .map_err(infra)?
            .rows_affected();
        if affected == 0 {
            return Err(StorageError::TableLookup(table_id));
        }
        Ok(())
    }
}

fn column_type_from_name(name: &str) -> Result<ColumnType> {
    let ty = match name {
        "int" => ColumnType::Int,
        "int2" => ColumnType::Int2,
        "int4" => ColumnType::Int4,
        "int8" => ColumnType::Int8,
        "serial" => ColumnType::Serial,
        "serial2" => ColumnType::Serial2,
        "serial4" => ColumnType::Serial4,
        "serial8" => ColumnType::Serial8,
        "text" => ColumnType::Text,
        "varchar" => ColumnType::Varchar,
        "bpchar" => ColumnType::Bpchar,
        "bool" => ColumnType::Bool,
        "float4" => ColumnType::Float4,
        "float8" => ColumnType::Float8,
        "numeric" => ColumnType::Numeric,
        "date" => ColumnType::Date,
        "timestamp" => ColumnType::Timestamp,
        "timestamptz" => ColumnType::Timestamptz,
        "uuid" => ColumnType::Uuid,
        "json" => ColumnType::Json,
        other => return Err(StorageError::Infrastructure(format!("corrupt column type {other}"))),
    };
    Ok(ty)
}

//─────────────────────────────
//  AclStoreBackend
//─────────────────────────────

fn abbrev_to_privileges(s: &str) -> Vec<Privilege> {
    s.chars().filter_map(Privilege::from_abbrev).collect()
}

#[async_trait]
impl AclStoreBackend for SqliteBackend {
    async fn grant(
        &self,
        chain_id: ChainId,
        table_id: TableId,
        grantee: Address,
        privileges: &[Privilege],
    ) -> Result<()> {
        let existing = self.privileges_of(chain_id, table_id, grantee).await?;
        let mut set: std::collections::BTreeSet<char> = existing.iter().map(|p| p.abbrev()).collect();
        for p in privileges {
            set.insert(p.abbrev());
        }
        let combined: String = set.into_iter().collect();
        sqlx::query(
            "INSERT INTO system_acl (chain_id, table_id, grantee, privileges, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (chain_id, table_id, grantee)
             DO UPDATE SET privileges = excluded.privileges, updated_at = excluded.updated_at",
        )
        .bind(chain_id.0 as i64)
        .bind(table_id.0 as i64)
        .bind(addr_hex(grantee))
        .bind(combined)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        Ok(())
    }

    async fn revoke(
        &self,
        chain_id: ChainId,
        table_id: TableId,
        grantee: Address,
        privileges: &[Privilege],
    ) -> Result<()> {
        let existing = self.privileges_of(chain_id, table_id, grantee).await?;
        let remove: std::collections::BTreeSet<char> = privileges.iter().map(|p| p.abbrev()).collect();
        let remaining: String = existing
            .into_iter()
            .map(|p| p.abbrev())
            .filter(|c| !remove.contains(c))
            .collect();
        if remaining.is_empty() {
            sqlx::query("DELETE FROM system_acl WHERE chain_id = ? AND table_id = ? AND grantee = ?")
                .bind(chain_id.0 as i64)
                .bind(table_id.0 as i64)
                .bind(addr_hex(grantee))
                .execute(&self.pool)
                .await
                .map_err(infra)?;
        } else {
            sqlx::query(
                "UPDATE system_acl SET privileges = ?, updated_at = ?
                 WHERE chain_id = ? AND table_id = ? AND grantee = ?",
            )
            .bind(remaining)
            .bind(Utc::now().to_rfc3339())
            .bind(chain_id.0 as i64)
            .bind(table_id.0 as i64)
            .bind(addr_hex(grantee))
            .execute(&self.pool)
            .await
            .map_err(infra)?;
        }
        Ok(())
    }

    async fn privileges_of(
        &self,
        chain_id: ChainId,
        table_id: TableId,
        grantee: Address,
    ) -> Result<Vec<Privilege>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT privileges FROM system_acl WHERE chain_id = ? AND table_id = ? AND grantee = ?",
        )
        .bind(chain_id.0 as i64)
        .bind(table_id.0 as i64)
        .bind(addr_hex(grantee))
        .fetch_optional(&self.pool)
        .await
        .map_err(infra)?;
        Ok(row.map(|(p,)| abbrev_to_privileges(&p)).unwrap_or_default())
    }

    async fn clear_grants(&self, chain_id: ChainId, table_id: TableId) -> Result<()> {
        sqlx::query("DELETE FROM system_acl WHERE chain_id = ? AND table_id = ?")
            .bind(chain_id.0 as i64)
            .bind(table_id.0 as i64)
            .execute(&self.pool)
            .await
            .map_err(infra)?;
        Ok(())
    }
}

//─────────────────────────────
//  ControllerStore
//─────────────────────────────

#[async_trait]
impl ControllerStore for SqliteBackend {
    async fn set_controller(&self, chain_id: ChainId, table_id: TableId, controller: Address) -> Result<()> {
        if controller == Address::ZERO {
            sqlx::query("DELETE FROM system_controller WHERE chain_id = ? AND table_id = ?")
                .bind(chain_id.0 as i64)
                .bind(table_id.0 as i64)
                .execute(&self.pool)
                .await
                .map_err(infra)?;
        } else {
            sqlx::query(
                "INSERT INTO system_controller (chain_id, table_id, controller) VALUES (?, ?, ?)
                 ON CONFLICT (chain_id, table_id) DO UPDATE SET controller = excluded.controller",
            )
            .bind(chain_id.0 as i64)
            .bind(table_id.0 as i64)
            .bind(addr_hex(controller))
            .execute(&self.pool)
            .await
            .map_err(infra)?;
        }
        Ok(())
    }

    async fn get_controller(&self, chain_id: ChainId, table_id: TableId) -> Result<Option<Address>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT controller FROM system_controller WHERE chain_id = ? AND table_id = ?")
                .bind(chain_id.0 as i64)
                .bind(table_id.0 as i64)
                .fetch_optional(&self.pool)
                .await
                .map_err(infra)?;
        row.map(|(c,)| parse_addr(&c)).transpose()
    }
}

//─────────────────────────────
//  EventLogStore
//─────────────────────────────

#[async_trait]
impl EventLogStore for SqliteBackend {
    async fn txn_events_persisted(&self, chain_id: ChainId, txn_hash: Hash32) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM system_evm_events WHERE chain_id = ? AND txn_hash = ? LIMIT 1",
        )
        .bind(chain_id.0 as i64)
        .bind(hex::encode(txn_hash))
        .fetch_optional(&self.pool)
        .await
        .map_err(infra)?;
        Ok(row.is_some())
    }

    async fn persist_txn_events(&self, chain_id: ChainId, events: &TxnEvents) -> Result<()> {
        if self.txn_events_persisted(chain_id, events.txn_hash).await? {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(infra)?;
        for (index, event) in events.events.iter().enumerate() {
            let topics = serde_json::to_string(&event.topics.iter().map(hex::encode).collect::<Vec<_>>())
                .map_err(infra)?;
            let event_json = serde_json::to_string(&event.decoded).map_err(infra)?;
            sqlx::query(
                "INSERT INTO system_evm_events
                 (chain_id, txn_hash, event_index, address, topics, data, block_number, tx_index, block_hash, event_json, event_type)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(chain_id.0 as i64)
            .bind(hex::encode(events.txn_hash))
            .bind(index as i64)
            .bind(addr_hex(event.address))
            .bind(topics)
            .bind(event.data.clone())
            .bind(event.block_number as i64)
            .bind(events.txn_index as i64)
            .bind(hex::encode(event.block_hash))
            .bind(event_json)
            .bind(event.decoded.type_name())
            .execute(&mut *tx)
            .await
            .map_err(infra)?;
        }
        tx.commit().await.map_err(infra)?;
        Ok(())
    }

    async fn load_txn_events(&self, chain_id: ChainId, txn_hash: Hash32) -> Result<Option<TxnEvents>> {
        let rows = sqlx::query(
            "SELECT event_json, tx_index FROM system_evm_events
             WHERE chain_id = ? AND txn_hash = ? ORDER BY event_index ASC",
        )
        .bind(chain_id.0 as i64)
        .bind(hex::encode(txn_hash))
        .fetch_all(&self.pool)
        .await
        .map_err(infra)?;
        if rows.is_empty() {
            return Ok(None);
        }
        let txn_index: i64 = rows[0].try_get("tx_index").map_err(infra)?;
        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            let event_json: String = row.try_get("event_json").map_err(infra)?;
            let decoded = serde_json::from_str(&event_json).map_err(infra)?;
            events.push(validator_types::EvmEvent {
                chain_id,
                txn_hash,
                log_index: 0,
                txn_index: txn_index as u32,
                block_number: 0,
                block_hash: Hash32::ZERO,
                address: Address::ZERO,
                topics: vec![],
                data: vec![],
                decoded,
            });
        }
        Ok(Some(TxnEvents {
            txn_hash,
            txn_index: txn_index as u32,
            events,
        }))
    }
}

//─────────────────────────────
//  BlockInfoStore
//─────────────────────────────

#[async_trait]
impl BlockInfoStore for SqliteBackend {
    async fn set_block_timestamp(
        &self,
        chain_id: ChainId,
        block_number: BlockNumber,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO system_evm_block_info (chain_id, block_number, timestamp) VALUES (?, ?, ?)
             ON CONFLICT (chain_id, block_number) DO UPDATE SET timestamp = excluded.timestamp",
        )
        .bind(chain_id.0 as i64)
        .bind(block_number as i64)
        .bind(timestamp.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        Ok(())
    }

    async fn blocks_missing_timestamp(
        &self,
        chain_id: ChainId,
        from: BlockNumber,
        to: BlockNumber,
    ) -> Result<Vec<BlockNumber>> {
        let present: Vec<(i64,)> = sqlx::query_as(
            "SELECT block_number FROM system_evm_block_info
             WHERE chain_id = ? AND block_number BETWEEN ? AND ?",
        )
        .bind(chain_id.0 as i64)
        .bind(from as i64)
        .bind(to as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(infra)?;
        let present: std::collections::HashSet<u64> = present.into_iter().map(|(n,)| n as u64).collect();
        Ok((from..=to).filter(|n| !present.contains(n)).collect())
    }

    async fn get_chain_health(&self, chain_id: ChainId) -> Result<ChainHealth> {
        let row: Option<(Option<String>, Option<i64>, Option<i64>)> = sqlx::query_as(
            "SELECT last_polled_at, lookback_skipped_from, lookback_skipped_to
             FROM system_chain_health WHERE chain_id = ?",
        )
        .bind(chain_id.0 as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(infra)?;
        let Some((last_polled_at, from, to)) = row else {
            return Ok(ChainHealth::new(chain_id));
        };
        Ok(ChainHealth {
            chain_id,
            last_polled_at: last_polled_at
                .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
                .transpose()
                .map_err(infra)?,
            lookback_skipped_from: from.map(|n| n as u64),
            lookback_skipped_to: to.map(|n| n as u64),
        })
    }

    async fn set_chain_health(&self, health: &ChainHealth) -> Result<()> {
        sqlx::query(
            "INSERT INTO system_chain_health (chain_id, last_polled_at, lookback_skipped_from, lookback_skipped_to)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (chain_id) DO UPDATE SET
                last_polled_at = excluded.last_polled_at,
                lookback_skipped_from = excluded.lookback_skipped_from,
                lookback_skipped_to = excluded.lookback_skipped_to",
        )
        .bind(health.chain_id.0 as i64)
        .bind(health.last_polled_at.map(|t| t.to_rfc3339()))
        .bind(health.lookback_skipped_from.map(|n| n as i64))
        .bind(health.lookback_skipped_to.map(|n| n as i64))
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        Ok(())
    }
}

//─────────────────────────────
//  ReceiptStore
//─────────────────────────────

#[async_trait]
impl ReceiptStore for SqliteBackend {
    async fn save_receipts(&self, receipts: &[Receipt]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(infra)?;
        for r in receipts {
            sqlx::query(
                "INSERT INTO system_txn_receipts (chain_id, txn_hash, block_number, index_in_block, error, table_id)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT (chain_id, txn_hash) DO UPDATE SET
                    block_number = excluded.block_number,
                    index_in_block = excluded.index_in_block,
                    error = excluded.error,
                    table_id = excluded.table_id",
            )
            .bind(r.chain_id.0 as i64)
            .bind(hex::encode(r.txn_hash))
            .bind(r.block_number as i64)
            .bind(r.index_in_block as i64)
            .bind(r.error.clone())
            .bind(r.table_id.map(|t| t.0 as i64))
            .execute(&mut *tx)
            .await
            .map_err(infra)?;
        }
        tx.commit().await.map_err(infra)?;
        Ok(())
    }

    async fn receipt_exists(&self, chain_id: ChainId, txn_hash: Hash32) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM system_txn_receipts WHERE chain_id = ? AND txn_hash = ?",
        )
        .bind(chain_id.0 as i64)
        .bind(hex::encode(txn_hash))
        .fetch_optional(&self.pool)
        .await
        .map_err(infra)?;
        Ok(row.is_some())
    }

    async fn get_receipt(&self, chain_id: ChainId, txn_hash: Hash32) -> Result<Option<Receipt>> {
        let row = sqlx::query(
            "SELECT block_number, index_in_block, error, table_id
             FROM system_txn_receipts WHERE chain_id = ? AND txn_hash = ?",
        )
        .bind(chain_id.0 as i64)
        .bind(hex::encode(txn_hash))
        .fetch_optional(&self.pool)
        .await
        .map_err(infra)?;
        let Some(row) = row else { return Ok(None) };
        let block_number: i64 = row.try_get("block_number").map_err(infra)?;
        let index_in_block: i64 = row.try_get("index_in_block").map_err(infra)?;
        let error: Option<String> = row.try_get("error").map_err(infra)?;
        let table_id: Option<i64> = row.try_get("table_id").map_err(infra)?;
        Ok(Some(Receipt {
            chain_id,
            txn_hash,
            block_number: block_number as u64,
            index_in_block: index_in_block as u32,
            table_id: table_id.map(|t| TableId(t as u64)),
            error,
        }))
    }
}

//─────────────────────────────
//  CursorStore
//─────────────────────────────

#[async_trait]
impl CursorStore for SqliteBackend {
    async fn get_cursor(&self, chain_id: ChainId) -> Result<Option<ProcessorCursor>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT block_number FROM system_txn_processor WHERE chain_id = ?")
                .bind(chain_id.0 as i64)
                .fetch_optional(&self.pool)
                .await
                .map_err(infra)?;
        Ok(row.map(|(b,)| ProcessorCursor {
            chain_id,
            block_number: b as u64,
        }))
    }

    async fn set_cursor(&self, cursor: ProcessorCursor) -> Result<()> {
        sqlx::query(
            "INSERT INTO system_txn_processor (chain_id, block_number) VALUES (?, ?)
             ON CONFLICT (chain_id) DO UPDATE SET block_number = excluded.block_number",
        )
        .bind(cursor.chain_id.0 as i64)
        .bind(cursor.block_number as i64)
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        Ok(())
    }
}

//─────────────────────────────
//  StateHashStore
//─────────────────────────────

#[async_trait]
impl StateHashStore for SqliteBackend {
    async fn save_state_hash(&self, hash: &StateHash) -> Result<()> {
        sqlx::query(
            "INSERT INTO system_state_hash (chain_id, block_number, hash) VALUES (?, ?, ?)
             ON CONFLICT (chain_id, block_number) DO UPDATE SET hash = excluded.hash",
        )
        .bind(hash.chain_id.0 as i64)
        .bind(hash.block_number as i64)
        .bind(hash_hex(&hash.hash))
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        Ok(())
    }

    async fn latest_state_hash(&self, chain_id: ChainId) -> Result<Option<StateHash>> {
        let row: Option<(i64, String)> = sqlx::query_as(
            "SELECT block_number, hash FROM system_state_hash
             WHERE chain_id = ? ORDER BY block_number DESC LIMIT 1",
        )
        .bind(chain_id.0 as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(infra)?;
        row.map(|(b, h)| {
            Ok(StateHash {
                chain_id,
                block_number: b as u64,
                hash: parse_hash32(&h)?,
            })
        })
        .transpose()
    }
}

//─────────────────────────────
//  SqlExecutor / StateComputer (generic trait boundary, spec §4.3 / §4.5)
//─────────────────────────────

#[async_trait]
impl SqlExecutor for SqliteBackend {
    async fn execute_ddl(&self, sql: &str) -> Result<()> {
        SqliteBackend::execute_ddl(self, sql).await
    }

    async fn execute_dml(&self, sql: &str) -> Result<u64> {
        SqliteBackend::execute_dml(self, sql).await
    }

    async fn row_count(&self, physical_table: &str) -> Result<u64> {
        SqliteBackend::row_count(self, physical_table).await
    }

    async fn execute_dml_returning_rowids(&self, sql: &str) -> Result<Vec<i64>> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        rows.iter()
            .map(|r| r.try_get::<i64, _>(0).map_err(|e| StorageError::Sqlite(e.to_string())))
            .collect()
    }
}

fn sanitize_savepoint_name(name: &str) -> Result<&str> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(StorageError::Infrastructure(format!("invalid savepoint name {name}")))
    }
}

#[async_trait]
impl Transactional for SqliteBackend {
    async fn begin_savepoint(&self, name: &str) -> Result<()> {
        let name = sanitize_savepoint_name(name)?;
        sqlx::query(&format!("SAVEPOINT {name}"))
            .execute(&self.pool)
            .await
            .map_err(infra)?;
        Ok(())
    }

    async fn release_savepoint(&self, name: &str) -> Result<()> {
        let name = sanitize_savepoint_name(name)?;
        sqlx::query(&format!("RELEASE SAVEPOINT {name}"))
            .execute(&self.pool)
            .await
            .map_err(infra)?;
        Ok(())
    }

    async fn rollback_savepoint(&self, name: &str) -> Result<()> {
        let name = sanitize_savepoint_name(name)?;
        sqlx::query(&format!("ROLLBACK TO SAVEPOINT {name}"))
            .execute(&self.pool)
            .await
            .map_err(infra)?;
        Ok(())
    }
}

#[async_trait]
impl StateComputer for SqliteBackend {
    async fn compute_state_hash(&self, chain_id: ChainId, block_number: BlockNumber) -> Result<StateHash> {
        StateHasher::new(self).state_hash(chain_id, block_number).await
    }
}

//─────────────────────────────
//  UserStore (read-only handle, spec §3)
//─────────────────────────────

/// A read-only capability over the same database the executor writes. Never
/// opens a write transaction; the type itself exposes no method that could.
pub struct UserStore {
    pool: SqlitePool,
}

impl UserStore {
    /// Shares the given backend's connection pool.
    pub fn from_backend(backend: &SqliteBackend) -> Self {
        Self { pool: backend.pool.clone() }
    }

    /// Executes a validated `ReadStmt`'s SQL text and returns each row as a
    /// JSON object, column name to value.
    pub async fn query(&self, sql: &str) -> Result<Vec<serde_json::Value>> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        rows.iter().map(row_to_json).collect()
    }
}

//─────────────────────────────
//  StateHasher (spec §4.5)
//─────────────────────────────

/// Produces the canonical, cross-validator-comparable per-chain state
/// digest.
pub struct StateHasher<'a> {
    backend: &'a SqliteBackend,
}

impl<'a> StateHasher<'a> {
    /// Binds a hasher to a backend.
    pub fn new(backend: &'a SqliteBackend) -> Self {
        Self { backend }
    }

    /// Computes `StateHash` for `chain_id` as of `block_number`: the
    /// registry, ACL and controller catalogs plus every user table,
    /// serialized in a fixed table order, rows sorted by primary key
    /// ascending, one length-prefixed cell encoding per column in
    /// declaration order, hashed with SHA-256.
    pub async fn state_hash(&self, chain_id: ChainId, block_number: BlockNumber) -> Result<StateHash> {
        let mut hasher = Sha256::new();

        hash_rows(
            &mut hasher,
            self.backend
                .fetch_rows_as_json(&format!(
                    "SELECT chain_id, id, controller_owner, prefix, structure_hash
                     FROM registry WHERE chain_id = {} ORDER BY id ASC",
                    chain_id.0
                ))
                .await?,
        );
        hash_rows(
            &mut hasher,
            self.backend
                .fetch_rows_as_json(&format!(
                    "SELECT chain_id, table_id, grantee, privileges
                     FROM system_acl WHERE chain_id = {} ORDER BY table_id ASC, grantee ASC",
                    chain_id.0
                ))
                .await?,
        );
        hash_rows(
            &mut hasher,
            self.backend
                .fetch_rows_as_json(&format!(
                    "SELECT chain_id, table_id, controller
                     FROM system_controller WHERE chain_id = {} ORDER BY table_id ASC",
                    chain_id.0
                ))
                .await?,
        );

        let tables: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, prefix FROM registry WHERE chain_id = ? ORDER BY id ASC",
        )
        .bind(chain_id.0 as i64)
        .fetch_all(self.backend.pool())
        .await
        .map_err(infra)?;
        for (id, prefix) in tables {
            let physical = format!("{prefix}_{}_{id}", chain_id.0);
            let rows = self
                .backend
                .fetch_rows_as_json(&format!("SELECT * FROM {physical} ORDER BY rowid ASC"))
                .await?;
            hash_rows(&mut hasher, rows);
        }

        let hash: [u8; 32] = hasher.finalize().into();
        Ok(StateHash { chain_id, block_number, hash })
    }
}

/// Feeds a length-prefixed encoding of every row's cells, in column order,
/// into `hasher`. Null is a distinguished one-byte tag (`0xff`) with no
/// following length, so its encoding can never collide with an empty text
/// or blob value (tag `0x00`, length `0`).
fn hash_rows(hasher: &mut Sha256, rows: Vec<serde_json::Value>) {
    for row in rows {
        let serde_json::Value::Object(map) = row else { continue };
        for (_key, value) in map {
            match value {
                serde_json::Value::Null => hasher.update([0xffu8]),
                serde_json::Value::Number(n) => {
                    hasher.update([0x01u8]);
                    let bytes = if let Some(i) = n.as_i64() {
                        i.to_be_bytes().to_vec()
                    } else {
                        n.to_string().into_bytes()
                    };
                    hasher.update((bytes.len() as u32).to_be_bytes());
                    hasher.update(&bytes);
                }
                serde_json::Value::String(s) => {
                    hasher.update([0x00u8]);
                    hasher.update((s.len() as u32).to_be_bytes());
                    hasher.update(s.as_bytes());
                }
                serde_json::Value::Bool(b) => {
                    hasher.update([0x02u8]);
                    hasher.update([b as u8]);
                }
                other => {
                    let s = other.to_string();
                    hasher.update([0x00u8]);
                    hasher.update((s.len() as u32).to_be_bytes());
                    hasher.update(s.as_bytes());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrates_cleanly_and_is_idempotent() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        backend.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn registry_round_trips() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        let row = TableRow {
            chain_id: ChainId(1337),
            table_id: TableId(1),
            owner: Address::ZERO,
            prefix: "foo".to_string(),
            structure_hash: [7u8; 32],
            columns: vec![ColumnDef { name: "a".into(), col_type: ColumnType::Int }],
            created_at: Utc::now(),
        };
        backend.insert_table(row.clone()).await.unwrap();
        let fetched = backend.get_table(ChainId(1337), TableId(1)).await.unwrap().unwrap();
        assert_eq!(fetched.prefix, "foo");
        assert_eq!(fetched.structure_hash, [7u8; 32]);
    }

    #[tokio::test]
    async fn acl_grant_and_revoke() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        let grantee = Address::ZERO;
        backend
            .grant(ChainId(1), TableId(1), grantee, &[Privilege::Insert, Privilege::Update])
            .await
            .unwrap();
        let privs = backend.privileges_of(ChainId(1), TableId(1), grantee).await.unwrap();
        assert_eq!(privs.len(), 2);
        backend.revoke(ChainId(1), TableId(1), grantee, &[Privilege::Insert]).await.unwrap();
        let privs = backend.privileges_of(ChainId(1), TableId(1), grantee).await.unwrap();
        assert_eq!(privs, vec![Privilege::Update]);
    }

    #[tokio::test]
    async fn cursor_advances() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        assert!(backend.get_cursor(ChainId(1)).await.unwrap().is_none());
        backend
            .set_cursor(ProcessorCursor { chain_id: ChainId(1), block_number: 10 })
            .await
            .unwrap();
        assert_eq!(
            backend.get_cursor(ChainId(1)).await.unwrap().unwrap().block_number,
            10
        );
    }

    #[tokio::test]
    async fn state_hash_is_deterministic_across_runs() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        let hasher = StateHasher::new(&backend);
        let a = hasher.state_hash(ChainId(1), 0).await.unwrap();
        let b = hasher.state_hash(ChainId(1), 0).await.unwrap();
        assert_eq!(a.hash, b.hash);
    }

    #[tokio::test]
    async fn chain_health_defaults_then_round_trips() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        let health = backend.get_chain_health(ChainId(9)).await.unwrap();
        assert!(health.lookback_skipped_from.is_none());
        let updated = ChainHealth {
            lookback_skipped_from: Some(100),
            lookback_skipped_to: Some(2095),
            ..health
        };
        backend.set_chain_health(&updated).await.unwrap();
        let fetched = backend.get_chain_health(ChainId(9)).await.unwrap();
        assert_eq!(fetched.lookback_skipped_from, Some(100));
    }
}
