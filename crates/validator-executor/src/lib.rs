#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **validator-executor** – the single-writer transaction executor.
//!
//! Applies one transaction's worth of decoded events atomically against the
//! physical store: `CreateTable` installs a registry row, default owner
//! grant and the physical table inside one savepoint; `RunSQL` enforces
//! either a controller's policy or the ACL before executing each statement;
//! `SetController` and `TransferTable` update the catalog directly. Every
//! acceptable failure (ACL denial, policy rejection, a constraint the query
//! itself caused) becomes a receipt and the transaction's savepoint is
//! rolled back; anything else propagates as an infrastructure error the
//! caller must retry the whole block for.

use tracing::warn;
use validator_sql::{MutatingStmt, SqlValidator};
use validator_store_core::prelude::*;
use validator_types::{
    Address, BlockNumber, ChainConfig, ChainId, DecodedEvent, EvmEvent, Hash32, Policy, Privilege,
    StateHash, TableId, TxnEvents,
};

//─────────────────────────────
//  TxnExecResult
//─────────────────────────────

/// Outcome of executing one transaction's events (spec §4.3).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnExecResult {
    /// The table the transaction concerned, if any event named one.
    pub table_id: Option<TableId>,
    /// `"<CODE>: <message>"` if an acceptable error halted the transaction;
    /// `None` on success.
    pub error: Option<String>,
}

//─────────────────────────────
//  Executor
//─────────────────────────────

/// Owns write access to one chain's slice of the physical store. Constructed
/// once per chain by that chain's `EventProcessor`.
pub struct Executor {
    store: std::sync::Arc<dyn Store>,
    validator: SqlValidator,
    config: ChainConfig,
}

impl Executor {
    /// Builds an executor for `config.chain_id`, writing through `store`.
    pub fn new(store: std::sync::Arc<dyn Store>, config: ChainConfig) -> Self {
        Self {
            store,
            validator: SqlValidator,
            config,
        }
    }

    /// The chain this executor writes for.
    pub fn chain_id(&self) -> ChainId {
        self.config.chain_id
    }

    /// The highest block number already committed, or `None` before the
    /// first commit.
    pub async fn last_processed_height(&self) -> Result<Option<BlockNumber>, StorageError> {
        Ok(self.store.get_cursor(self.config.chain_id).await?.map(|c| c.block_number))
    }

    /// Opens a scope bound to one block. Callers (the `EventProcessor`) are
    /// responsible for keeping exactly one scope open per chain at a time;
    /// the type itself does not enforce that (spec §4.4's concurrency
    /// invariant is the caller's contract, not this one's).
    pub fn open_block(&self, block_number: BlockNumber) -> BlockScope<'_> {
        BlockScope {
            executor: self,
            block_number,
        }
    }
}

//─────────────────────────────
//  BlockScope
//─────────────────────────────

/// One block's worth of atomic transaction application.
pub struct BlockScope<'a> {
    executor: &'a Executor,
    block_number: BlockNumber,
}

impl<'a> BlockScope<'a> {
    /// The block this scope is bound to.
    pub fn block_number(&self) -> BlockNumber {
        self.block_number
    }

    /// True if a receipt already exists for `txn_hash` — the processor's
    /// reorg-dedup check before calling `execute_txn_events`.
    pub async fn txn_receipt_exists(&self, txn_hash: Hash32) -> Result<bool, StorageError> {
        self.executor.store.receipt_exists(self.executor.config.chain_id, txn_hash).await
    }

    /// Runs every event of one transaction inside a single savepoint. An
    /// acceptable (on-chain) failure rolls the savepoint back and returns a
    /// result carrying the error; the savepoint is released only once every
    /// event in the transaction has succeeded.
    pub async fn execute_txn_events(&self, events: &TxnEvents) -> Result<TxnExecResult, StorageError> {
        let store = &self.executor.store;
        let savepoint = format!("txn_{}", events.txn_index);
        store.begin_savepoint(&savepoint).await?;

        let mut result = TxnExecResult::default();
        for event in &events.events {
            match self.execute_one_event(event).await {
                Ok(table_id) => {
                    if table_id.is_some() {
                        result.table_id = table_id;
                    }
                }
                Err(ExecEventError::OnChain { table_id, message }) => {
                    store.rollback_savepoint(&savepoint).await?;
                    result.table_id = table_id;
                    result.error = Some(message);
                    return Ok(result);
                }
                Err(ExecEventError::Infrastructure(e)) => return Err(e),
            }
        }

        store.release_savepoint(&savepoint).await?;
        Ok(result)
    }

    async fn execute_one_event(&self, event: &EvmEvent) -> Result<Option<TableId>, ExecEventError> {
        let chain_id = self.executor.config.chain_id;
        match &event.decoded {
            DecodedEvent::CreateTable { owner, table_id, statement } => {
                self.handle_create_table(chain_id, *owner, *table_id, statement).await
            }
            DecodedEvent::RunSql {
                caller,
                is_owner,
                table_id,
                statement,
                policy,
            } => self.handle_run_sql(chain_id, *caller, *is_owner, *table_id, statement, policy).await,
            DecodedEvent::SetController {
                caller: _,
                table_id,
                controller,
            } => self.handle_set_controller(chain_id, *table_id, *controller).await,
            DecodedEvent::TransferTable { from: _, to, table_id } => {
                self.handle_transfer_table(chain_id, *table_id, *to).await
            }
            DecodedEvent::Transfer { .. } => Ok(None),
        }
    }

    async fn handle_create_table(
        &self,
        chain_id: ChainId,
        owner: Address,
        table_id: TableId,
        statement: &str,
    ) -> Result<Option<TableId>, ExecEventError> {
        let create = self
            .executor
            .validator
            .validate_create_table(statement, chain_id)
            .map_err(|e| ExecEventError::on_chain(Some(table_id), e.to_string()))?;

        let physical_sql = create.raw_query_for_table_id(table_id);
        let store = &self.executor.store;

        store
            .execute_ddl(&physical_sql)
            .await
            .map_err(|e| classify(Some(table_id), e))?;

        let row = TableRow {
            chain_id,
            table_id,
            owner,
            prefix: create.prefix().to_string(),
            structure_hash: create.structure_hash(),
            columns: create.columns().to_vec(),
            created_at: chrono::Utc::now(),
        };
        store.insert_table(row).await.map_err(|e| classify(Some(table_id), e))?;
        store
            .grant(
                chain_id,
                table_id,
                owner,
                &[Privilege::Insert, Privilege::Update, Privilege::Delete],
            )
            .await
            .map_err(|e| classify(Some(table_id), e))?;

        Ok(Some(table_id))
    }

    async fn handle_run_sql(
        &self,
        chain_id: ChainId,
        caller: Address,
        is_owner: bool,
        table_id: TableId,
        statement: &str,
        policy: &Option<Policy>,
    ) -> Result<Option<TableId>, ExecEventError> {
        let store = &self.executor.store;

        let table = store
            .get_table(chain_id, table_id)
            .await
            .map_err(|e| classify(Some(table_id), e))?
            .ok_or_else(|| ExecEventError::on_chain(Some(table_id), StorageError::TableLookup(table_id).to_string()))?;

        let mut statements = self
            .executor
            .validator
            .validate_mutating_query(statement, chain_id)
            .map_err(|e| ExecEventError::on_chain(Some(table_id), e.to_string()))?;

        for stmt in &statements {
            if stmt.table_id() != table_id {
                return Err(ExecEventError::on_chain(
                    Some(table_id),
                    format!("query targets table {} and not {}", stmt.table_id().0, table_id.0),
                ));
            }
        }

        for stmt in &mut statements {
            match policy {
                Some(policy) => self.apply_policy_and_execute(chain_id, &table.prefix, table_id, stmt, policy).await?,
                None => self.apply_acl_and_execute(chain_id, &table.prefix, table_id, caller, is_owner, stmt).await?,
            }
        }

        Ok(Some(table_id))
    }

    async fn apply_acl_and_execute(
        &self,
        chain_id: ChainId,
        prefix: &str,
        table_id: TableId,
        caller: Address,
        is_owner: bool,
        stmt: &mut MutatingStmt,
    ) -> Result<(), ExecEventError> {
        let store = &self.executor.store;
        let physical = format!("{prefix}_{}_{}", chain_id.0, table_id.0);

        match stmt {
            MutatingStmt::Grant { grantee, privileges, .. } => {
                if !is_owner {
                    return Err(ExecEventError::on_chain(
                        Some(table_id),
                        "ACL: only the table owner may grant privileges".to_string(),
                    ));
                }
                let grantee = parse_grantee(grantee)?;
                store.grant(chain_id, table_id, grantee, privileges).await.map_err(|e| classify(Some(table_id), e))?;
                return Ok(());
            }
            MutatingStmt::Revoke { grantee, privileges, .. } => {
                if !is_owner {
                    return Err(ExecEventError::on_chain(
                        Some(table_id),
                        "ACL: only the table owner may revoke privileges".to_string(),
                    ));
                }
                let grantee = parse_grantee(grantee)?;
                store.revoke(chain_id, table_id, grantee, privileges).await.map_err(|e| classify(Some(table_id), e))?;
                return Ok(());
            }
            _ => {}
        }

        let needed = match stmt {
            MutatingStmt::Insert { .. } => Privilege::Insert,
            MutatingStmt::Update { .. } => Privilege::Update,
            MutatingStmt::Delete { .. } => Privilege::Delete,
            MutatingStmt::Grant { .. } | MutatingStmt::Revoke { .. } => unreachable!("handled above"),
        };

        if !is_owner {
            let privs = store.privileges_of(chain_id, table_id, caller).await.map_err(|e| classify(Some(table_id), e))?;
            if !privs.contains(&needed) {
                return Err(ExecEventError::on_chain(Some(table_id), "ACL: not enough privileges".to_string()));
            }
        }

        if matches!(stmt, MutatingStmt::Insert { .. }) {
            self.check_row_count_limit(table_id, &physical).await?;
        }

        stmt.rewrite_table_name(&physical);
        store.execute_dml(&stmt.get_sql()).await.map_err(|e| classify(Some(table_id), e))?;
        Ok(())
    }

    async fn apply_policy_and_execute(
        &self,
        chain_id: ChainId,
        prefix: &str,
        table_id: TableId,
        stmt: &mut MutatingStmt,
        policy: &Policy,
    ) -> Result<(), ExecEventError> {
        let store = &self.executor.store;
        let physical = format!("{prefix}_{}_{}", chain_id.0, table_id.0);

        let (allowed, verb) = match stmt {
            MutatingStmt::Insert { .. } => (policy.allow_insert, "insert"),
            MutatingStmt::Update { .. } => (policy.allow_update, "update"),
            MutatingStmt::Delete { .. } => (policy.allow_delete, "delete"),
            MutatingStmt::Grant { .. } | MutatingStmt::Revoke { .. } => {
                return Err(ExecEventError::on_chain(
                    Some(table_id),
                    "POLICY: GRANT/REVOKE is not permitted on a controller-governed table".to_string(),
                ))
            }
        };
        if !allowed {
            return Err(ExecEventError::on_chain(
                Some(table_id),
                format!("POLICY: {verb} is not allowed by policy"),
            ));
        }

        if let (MutatingStmt::Update { assignments, .. }, Some(updatable)) = (&*stmt, &policy.updatable_columns) {
            for assignment in assignments {
                let column = assignment.id.last().map(|i| i.value.as_str()).unwrap_or_default();
                if !updatable.iter().any(|c| c == column) {
                    return Err(ExecEventError::on_chain(
                        Some(table_id),
                        format!("POLICY: column {column} is not updatable by policy"),
                    ));
                }
            }
        }

        if let Some(where_clause) = &policy.where_clause {
            let extra = parse_policy_fragment(chain_id, &physical, where_clause)?;
            stmt.add_where_clause(extra).map_err(|e| {
                ExecEventError::on_chain(Some(table_id), StorageError::PolicyApplyWhereClause(e.to_string()).to_string())
            })?;
        }

        if matches!(stmt, MutatingStmt::Insert { .. }) {
            self.check_row_count_limit(table_id, &physical).await?;
        }

        stmt.rewrite_table_name(&physical);

        if let Some(with_check) = &policy.with_check {
            stmt.add_returning_clause().map_err(|e| ExecEventError::on_chain(Some(table_id), e.to_string()))?;
            let affected = store
                .execute_dml_returning_rowids(&stmt.get_sql())
                .await
                .map_err(|e| classify(Some(table_id), e))?;
            if affected.is_empty() {
                return Ok(());
            }
            let ids = affected.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",");
            let check_sql = format!("SELECT count(*) FROM {physical} WHERE ({with_check}) AND rowid IN ({ids})");
            let rows = store.execute_dml_returning_rowids(&check_sql).await.map_err(|e| classify(Some(table_id), e))?;
            let satisfied = rows.first().copied().unwrap_or(0) as usize;
            if satisfied != affected.len() {
                return Err(ExecEventError::on_chain(
                    Some(table_id),
                    StorageError::PolicyWithCheck("affected rows do not satisfy the controller's check".to_string())
                        .to_string(),
                ));
            }
            Ok(())
        } else {
            store.execute_dml(&stmt.get_sql()).await.map_err(|e| classify(Some(table_id), e))?;
            Ok(())
        }
    }

    async fn check_row_count_limit(&self, table_id: TableId, physical: &str) -> Result<(), ExecEventError> {
        if let Some(max_rows) = self.executor.config.max_rows {
            let current = self
                .executor
                .store
                .row_count(physical)
                .await
                .map_err(|e| classify(Some(table_id), e))?;
            if current >= max_rows {
                return Err(ExecEventError::on_chain(
                    Some(table_id),
                    StorageError::RowCountLimit(table_id).to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn handle_set_controller(
        &self,
        chain_id: ChainId,
        table_id: TableId,
        controller: Address,
    ) -> Result<Option<TableId>, ExecEventError> {
        self.executor
            .store
            .set_controller(chain_id, table_id, controller)
            .await
            .map_err(|e| classify(Some(table_id), e))?;
        Ok(Some(table_id))
    }

    async fn handle_transfer_table(
        &self,
        chain_id: ChainId,
        table_id: TableId,
        new_owner: Address,
    ) -> Result<Option<TableId>, ExecEventError> {
        let store = &self.executor.store;
        store.set_owner(chain_id, table_id, new_owner).await.map_err(|e| classify(Some(table_id), e))?;
        store.clear_grants(chain_id, table_id).await.map_err(|e| classify(Some(table_id), e))?;
        store
            .grant(chain_id, table_id, new_owner, &[Privilege::Insert, Privilege::Update, Privilege::Delete])
            .await
            .map_err(|e| classify(Some(table_id), e))?;
        Ok(Some(table_id))
    }

    /// Persists receipts produced for every transaction in this block.
    pub async fn save_txn_receipts(&self, receipts: &[validator_types::Receipt]) -> Result<(), StorageError> {
        self.executor.store.save_receipts(receipts).await
    }

    /// Advances the chain's cursor to this scope's block.
    pub async fn set_last_processed_height(&self) -> Result<(), StorageError> {
        self.executor
            .store
            .set_cursor(validator_types::ProcessorCursor {
                chain_id: self.executor.config.chain_id,
                block_number: self.block_number,
            })
            .await
    }

    /// Computes and persists the canonical state hash as of this block.
    pub async fn state_hash(&self) -> Result<StateHash, StorageError> {
        let hash = self
            .executor
            .store
            .compute_state_hash(self.executor.config.chain_id, self.block_number)
            .await?;
        self.executor.store.save_state_hash(&hash).await?;
        Ok(hash)
    }
}

fn parse_grantee(grantee: &str) -> Result<Address, ExecEventError> {
    grantee
        .parse()
        .map_err(|e| ExecEventError::on_chain(None, format!("ACL: malformed grantee address: {e}")))
}

/// Parses a controller-supplied `where_clause`/`with_check` fragment
/// through the same deterministic-subset pipeline as on-chain statements
/// (Design Notes §9): wrapped in a throwaway `SELECT` so the fragment can be
/// scanned for joins, subqueries and non-deterministic functions before
/// being spliced into the real statement.
fn parse_policy_fragment(
    chain_id: ChainId,
    physical: &str,
    fragment: &str,
) -> Result<sqlparser::ast::Expr, ExecEventError> {
    let probe = format!("SELECT * FROM {physical} WHERE {fragment}");
    let read = validator_sql::SqlValidator
        .validate_read_query(&probe)
        .map_err(|e| ExecEventError::on_chain(None, format!("POLICY_APPLY_WHERE_CLAUSE: {e}")))?;
    let _ = chain_id;
    extract_where_expr(&read.get_sql())
}

fn extract_where_expr(rendered_select: &str) -> Result<sqlparser::ast::Expr, ExecEventError> {
    use sqlparser::ast::{SetExpr, Statement};
    use sqlparser::dialect::GenericDialect;
    use sqlparser::parser::Parser;

    let mut statements = Parser::parse_sql(&GenericDialect {}, rendered_select)
        .map_err(|e| ExecEventError::on_chain(None, format!("POLICY_APPLY_WHERE_CLAUSE: {e}")))?;
    let statement = statements
        .pop()
        .ok_or_else(|| ExecEventError::on_chain(None, "POLICY_APPLY_WHERE_CLAUSE: empty probe".to_string()))?;
    let Statement::Query(query) = statement else {
        return Err(ExecEventError::on_chain(None, "POLICY_APPLY_WHERE_CLAUSE: probe was not a query".to_string()));
    };
    let SetExpr::Select(select) = *query.body else {
        return Err(ExecEventError::on_chain(None, "POLICY_APPLY_WHERE_CLAUSE: unexpected probe shape".to_string()));
    };
    select
        .selection
        .ok_or_else(|| ExecEventError::on_chain(None, "POLICY_APPLY_WHERE_CLAUSE: fragment has no predicate".to_string()))
}

//─────────────────────────────
//  Internal error classification
//─────────────────────────────

enum ExecEventError {
    OnChain { table_id: Option<TableId>, message: String },
    Infrastructure(StorageError),
}

impl ExecEventError {
    fn on_chain(table_id: Option<TableId>, message: String) -> Self {
        ExecEventError::OnChain { table_id, message }
    }
}

fn classify(table_id: Option<TableId>, error: StorageError) -> ExecEventError {
    if error.is_on_chain() {
        ExecEventError::OnChain { table_id, message: error.to_string() }
    } else {
        warn!(?table_id, %error, "infrastructure failure while executing transaction");
        ExecEventError::Infrastructure(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use validator_store_sqlite::SqliteBackend;
    use validator_types::{ChainConfig, Hash32};

    fn test_config(chain_id: u64) -> ChainConfig {
        ChainConfig {
            chain_id: ChainId(chain_id),
            contract_address: Address::ZERO,
            start_height: 0,
            min_chain_depth: 0,
            poll_interval: std::time::Duration::from_secs(1),
            max_fetch_window: 1000,
            hash_step: 1,
            max_rows: None,
            block_failed_backoff: std::time::Duration::from_secs(1),
            rpc_timeout: std::time::Duration::from_secs(1),
            header_fetch_parallelism: 1,
            lossy_lookback: false,
        }
    }

    fn create_table_event(owner: Address, table_id: TableId, txn_index: u32) -> TxnEvents {
        TxnEvents {
            txn_hash: Hash32::ZERO,
            txn_index,
            events: vec![EvmEvent {
                chain_id: ChainId(1337),
                txn_hash: Hash32::ZERO,
                log_index: 0,
                txn_index,
                block_number: 1,
                block_hash: Hash32::ZERO,
                address: Address::ZERO,
                topics: vec![],
                data: vec![],
                decoded: DecodedEvent::CreateTable {
                    owner,
                    table_id,
                    statement: "CREATE TABLE foo_1337 (a int, b text)".to_string(),
                },
            }],
        }
    }

    #[tokio::test]
    async fn create_table_then_insert_round_trips() {
        let backend = Arc::new(SqliteBackend::in_memory().await.unwrap());
        let executor = Executor::new(backend, test_config(1337));
        let scope = executor.open_block(1);

        let owner = "0x0000000000000000000000000000000000000a".parse().unwrap();
        let create = create_table_event(owner, TableId(1), 0);
        let result = scope.execute_txn_events(&create).await.unwrap();
        assert_eq!(result.table_id, Some(TableId(1)));
        assert!(result.error.is_none());

        let insert = TxnEvents {
            txn_hash: Hash32::repeat_byte(1),
            txn_index: 1,
            events: vec![EvmEvent {
                chain_id: ChainId(1337),
                txn_hash: Hash32::repeat_byte(1),
                log_index: 0,
                txn_index: 1,
                block_number: 1,
                block_hash: Hash32::ZERO,
                address: Address::ZERO,
                topics: vec![],
                data: vec![],
                decoded: DecodedEvent::RunSql {
                    caller: owner,
                    is_owner: true,
                    table_id: TableId(1),
                    statement: "INSERT INTO foo_1337_1 VALUES (1, 'x')".to_string(),
                    policy: None,
                },
            }],
        };
        let result = scope.execute_txn_events(&insert).await.unwrap();
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn acl_denies_unauthorized_caller() {
        let backend = Arc::new(SqliteBackend::in_memory().await.unwrap());
        let executor = Executor::new(backend, test_config(1337));
        let scope = executor.open_block(1);

        let owner: Address = "0x000000000000000000000000000000000000aa".parse().unwrap();
        let other: Address = "0x000000000000000000000000000000000000bb".parse().unwrap();
        scope.execute_txn_events(&create_table_event(owner, TableId(1), 0)).await.unwrap();

        let insert = TxnEvents {
            txn_hash: Hash32::repeat_byte(2),
            txn_index: 1,
            events: vec![EvmEvent {
                chain_id: ChainId(1337),
                txn_hash: Hash32::repeat_byte(2),
                log_index: 0,
                txn_index: 1,
                block_number: 1,
                block_hash: Hash32::ZERO,
                address: Address::ZERO,
                topics: vec![],
                data: vec![],
                decoded: DecodedEvent::RunSql {
                    caller: other,
                    is_owner: false,
                    table_id: TableId(1),
                    statement: "INSERT INTO foo_1337_1 VALUES (2, 'y')".to_string(),
                    policy: None,
                },
            }],
        };
        let result = scope.execute_txn_events(&insert).await.unwrap();
        assert_eq!(result.error.as_deref(), Some("ACL: not enough privileges"));
    }

    #[tokio::test]
    async fn policy_rejects_disallowed_operation() {
        let backend = Arc::new(SqliteBackend::in_memory().await.unwrap());
        let executor = Executor::new(backend, test_config(1337));
        let scope = executor.open_block(1);

        let owner: Address = "0x000000000000000000000000000000000000aa".parse().unwrap();
        scope.execute_txn_events(&create_table_event(owner, TableId(1), 0)).await.unwrap();

        let policy = Policy {
            allow_insert: true,
            allow_update: true,
            allow_delete: false,
            where_clause: None,
            updatable_columns: None,
            with_check: None,
        };
        let delete = TxnEvents {
            txn_hash: Hash32::repeat_byte(3),
            txn_index: 1,
            events: vec![EvmEvent {
                chain_id: ChainId(1337),
                txn_hash: Hash32::repeat_byte(3),
                log_index: 0,
                txn_index: 1,
                block_number: 1,
                block_hash: Hash32::ZERO,
                address: Address::ZERO,
                topics: vec![],
                data: vec![],
                decoded: DecodedEvent::RunSql {
                    caller: owner,
                    is_owner: true,
                    table_id: TableId(1),
                    statement: "DELETE FROM foo_1337_1 WHERE a = 1".to_string(),
                    policy: Some(policy),
                },
            }],
        };
        let result = scope.execute_txn_events(&delete).await.unwrap();
        assert_eq!(result.error.as_deref(), Some("POLICY: delete is not allowed by policy"));
    }

    #[tokio::test]
    async fn transfer_table_clears_prior_grants() {
        let backend = Arc::new(SqliteBackend::in_memory().await.unwrap());
        let executor = Executor::new(backend, test_config(1337));
        let scope = executor.open_block(1);

        let owner: Address = "0x000000000000000000000000000000000000aa".parse().unwrap();
        let new_owner: Address = "0x000000000000000000000000000000000000cc".parse().unwrap();
        scope.execute_txn_events(&create_table_event(owner, TableId(1), 0)).await.unwrap();

        let transfer = TxnEvents {
            txn_hash: Hash32::repeat_byte(4),
            txn_index: 1,
            events: vec![EvmEvent {
                chain_id: ChainId(1337),
                txn_hash: Hash32::repeat_byte(4),
                log_index: 0,
                txn_index: 1,
                block_number: 1,
                block_hash: Hash32::ZERO,
                address: Address::ZERO,
                topics: vec![],
                data: vec![],
                decoded: DecodedEvent::TransferTable { from: owner, to: new_owner, table_id: TableId(1) },
            }],
        };
        let result = scope.execute_txn_events(&transfer).await.unwrap();
        assert!(result.error.is_none());
    }
}
