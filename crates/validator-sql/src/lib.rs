#![deny(missing_docs)]

//! **validator-sql** – the deterministic-subset SQL validator.
//!
//! Accepts exactly the statements a replicated, cross-validator-deterministic
//! database can safely execute: a single `CREATE TABLE`, a same-table batch
//! of `INSERT`/`UPDATE`/`DELETE`/`GRANT`/`REVOKE`, or a single top-level
//! `SELECT`. Everything else — joins or subqueries in a mutation, `RETURNING`,
//! relation aliases, non-deterministic functions, references to the
//! system-owned catalog tables — is rejected here, before it ever reaches the
//! executor.
//!
//! Parsed statements are never handed back as raw strings. Each entry point
//! returns an opaque handle (`CreateStmt`, `MutatingStmt`, `ReadStmt`)
//! wrapping a [`sqlparser`] AST; callers mutate it only through the named
//! methods below (`add_where_clause`, `rewrite_table_name`, `get_sql`, …).

use std::fmt;

use sqlparser::ast::{
    Assignment, ColumnDef as AstColumnDef, DataType, Expr, FunctionArguments, GrantObjects,
    Ident, ObjectName, Privileges, Query, SelectItem, SetExpr, Statement, TableFactor,
    TableWithJoins, Value,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use validator_types::{ChainId, ColumnDef, ColumnType, TableId};

/// Maximum number of columns a `CREATE TABLE` may declare.
pub const MAX_COLUMNS: usize = 64;
/// Maximum length, in bytes, of any text literal appearing in a mutating
/// statement.
pub const MAX_TEXT_LENGTH: usize = 8192;
/// Maximum length, in bytes, of a read (`SELECT`) query's source text.
pub const MAX_READ_QUERY_SIZE: usize = 65536;
/// Maximum number of privileges a single `GRANT`/`REVOKE` may name.
pub const MAX_GRANT_PRIVILEGES: usize = 3;

/// Name prefixes reserved for the validator's own catalog tables; a
/// user-chosen table prefix may never start with one of these.
pub const RESERVED_PREFIXES: &[&str] = &["system_", "registry", "pg_", "sqlite_"];

/// Function names considered non-deterministic and therefore rejected from
/// any mutating statement (session time, randomness, or identity generation
/// that would diverge across independently-replaying validators).
const NONDETERMINISTIC_FUNCTIONS: &[&str] = &[
    "current_timestamp",
    "current_date",
    "current_time",
    "now",
    "random",
    "rand",
    "uuid",
    "gen_random_uuid",
    "localtimestamp",
    "localtime",
];

/// Errors `validator-sql` can raise while admitting a statement. Named after
/// spec error codes so executor receipts can render `"{CODE}: {message}"`
/// directly from the `Display` impl.
#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    /// The SQL text did not parse at all.
    #[error("INVALID_SYNTAX: {0}")]
    InvalidSyntax(String),
    /// No statement was present in the input.
    #[error("EMPTY_STATEMENT: query text contained no statement")]
    EmptyStatement,
    /// More than one statement was supplied where exactly one is required.
    #[error("NO_SINGLE_STATEMENT: expected exactly one statement")]
    NoSingleStatement,
    /// `validate_create_table` was given something other than `CREATE TABLE`.
    #[error("NO_TOP_LEVEL_CREATE: expected a CREATE TABLE statement")]
    NoTopLevelCreate,
    /// `validate_read_query` was given something other than `SELECT`.
    #[error("NO_TOP_LEVEL_SELECT: expected a SELECT statement")]
    NoTopLevelSelect,
    /// `validate_mutating_query` was given a statement kind it doesn't admit.
    #[error("NO_TOP_LEVEL_WRITE_OR_GRANT: expected INSERT, UPDATE, DELETE, GRANT or REVOKE")]
    NoTopLevelWriteOrGrant,
    /// A `RETURNING` clause was present on a mutating statement.
    #[error("RETURNING_CLAUSE: RETURNING is not permitted")]
    ReturningClause,
    /// A table was referenced through an alias instead of its bare name.
    #[error("RELATION_ALIAS: table aliases are not permitted")]
    RelationAlias,
    /// A join or subquery appeared in a mutating statement.
    #[error("JOIN_OR_SUBQUERY: joins and subqueries are not permitted here")]
    JoinOrSubquery,
    /// A non-deterministic function call was found.
    #[error("NON_DETERMINISTIC_FUNCTION: {0} is not deterministic")]
    NonDeterministicFunction(String),
    /// A statement referenced a reserved, system-owned table name.
    #[error("SYSTEM_TABLE_REFERENCING: {0} is a reserved system table prefix")]
    SystemTableReferencing(String),
    /// A table name did not match the `{prefix}_{chain_id}[_{table_id}]`
    /// shape, or its embedded chain id did not match the caller's.
    #[error("INVALID_TABLE_NAME: {0}")]
    InvalidTableName(String),
    /// A multi-statement mutation referenced more than one physical table.
    #[error("MULTI_TABLE_REFERENCE: all statements must target the same table")]
    MultiTableReference,
    /// `CREATE TABLE` declared more columns than `MAX_COLUMNS`.
    #[error("TOO_MANY_COLUMNS: declared {0}, maximum is {MAX_COLUMNS}")]
    TooManyColumns(usize),
    /// A text literal exceeded `MAX_TEXT_LENGTH`.
    #[error("TEXT_TOO_LONG: literal of {0} bytes exceeds the {MAX_TEXT_LENGTH} byte limit")]
    TextTooLong(usize),
    /// The raw query text exceeded `MAX_READ_QUERY_SIZE`.
    #[error("QUERY_TOO_LONG: query of {0} bytes exceeds the {MAX_READ_QUERY_SIZE} byte limit")]
    QueryTooLong(usize),
    /// A column declared a type outside the accepted deterministic set.
    #[error("INVALID_COLUMN_TYPE: {0}")]
    InvalidColumnType(String),
    /// A `GRANT`/`REVOKE` grantee was not a 20-byte hex Ethereum address.
    #[error("ROLE_IS_NOT_AN_ETH_ADDRESS: {0}")]
    RoleIsNotAnEthAddress(String),
    /// `GRANT ALL` or an equivalent unrestricted privilege set was used.
    #[error("ALL_PRIVILEGES_NOT_ALLOWED: privileges must be named individually")]
    AllPrivilegesNotAllowed,
    /// A `GRANT`/`REVOKE` named a privilege outside {INSERT, UPDATE, DELETE}.
    #[error("NO_INSERT_UPDATE_DELETE_PRIVILEGE: {0} is not a grantable privilege")]
    NoInsertUpdateDeletePrivilege(String),
    /// A statement kind the validator recognizes but does not support here.
    #[error("STATEMENT_IS_NOT_SUPPORTED: {0}")]
    StatementIsNotSupported(String),
}

type Result<T> = std::result::Result<T, ValidatorError>;

fn parse(sql: &str) -> Result<Vec<Statement>> {
    Parser::parse_sql(&GenericDialect {}, sql).map_err(|e| ValidatorError::InvalidSyntax(e.to_string()))
}

/// Splits a user-facing table name into its `(prefix, chain_id, table_id)`
/// parts. `table_id` is `None` for the `CREATE TABLE` shape, where it does
/// not exist yet.
fn split_table_name(name: &str) -> Option<(String, u64, Option<u64>)> {
    let mut parts: Vec<&str> = name.rsplitn(3, '_').collect();
    parts.reverse();
    match parts.as_slice() {
        [prefix, chain] => {
            let chain_id: u64 = chain.parse().ok()?;
            Some((prefix.to_string(), chain_id, None))
        }
        [prefix, chain, table] => {
            let chain_id: u64 = chain.parse().ok()?;
            let table_id: u64 = table.parse().ok()?;
            Some((prefix.to_string(), chain_id, Some(table_id)))
        }
        _ => None,
    }
}

fn object_name_to_string(name: &ObjectName) -> String {
    name.0
        .iter()
        .map(|i| i.value.clone())
        .collect::<Vec<_>>()
        .join(".")
}

fn reject_reserved_prefix(prefix: &str) -> Result<()> {
    if RESERVED_PREFIXES.iter().any(|r| prefix.starts_with(r)) {
        return Err(ValidatorError::SystemTableReferencing(prefix.to_string()));
    }
    Ok(())
}

fn data_type_to_column_type(dt: &DataType) -> Result<ColumnType> {
    let ty = match dt {
        DataType::Int(_) | DataType::Integer(_) => ColumnType::Int,
        DataType::SmallInt(_) => ColumnType::Int2,
        DataType::Int4(_) => ColumnType::Int4,
        DataType::BigInt(_) | DataType::Int8(_) => ColumnType::Int8,
        DataType::Text | DataType::String(_) => ColumnType::Text,
        DataType::Varchar(_) => ColumnType::Varchar,
        DataType::Char(_) | DataType::CharacterFixed(_) => ColumnType::Bpchar,
        DataType::Boolean | DataType::Bool => ColumnType::Bool,
        DataType::Float4 | DataType::Real => ColumnType::Float4,
        DataType::Float8 | DataType::Double | DataType::DoublePrecision => ColumnType::Float8,
        DataType::Numeric(_) | DataType::Decimal(_) => ColumnType::Numeric,
        DataType::Date => ColumnType::Date,
        DataType::Timestamp(_, tz) => {
            if matches!(tz, sqlparser::ast::TimezoneInfo::Tz | sqlparser::ast::TimezoneInfo::WithTimeZone) {
                ColumnType::Timestamptz
            } else {
                ColumnType::Timestamp
            }
        }
        DataType::Uuid => ColumnType::Uuid,
        DataType::JSON => ColumnType::Json,
        DataType::Custom(name, _) => {
            let name = object_name_to_string(name).to_ascii_lowercase();
            match name.as_str() {
                "serial" => ColumnType::Serial,
                "serial2" | "smallserial" => ColumnType::Serial2,
                "serial4" => ColumnType::Serial4,
                "serial8" | "bigserial" => ColumnType::Serial8,
                other => return Err(ValidatorError::InvalidColumnType(other.to_string())),
            }
        }
        other => return Err(ValidatorError::InvalidColumnType(format!("{other}"))),
    };
    Ok(ty)
}

/// Recursively scans an expression tree for disallowed constructs:
/// non-deterministic function calls, and (when `allow_subquery` is false)
/// subqueries.
fn scan_expr(expr: &Expr, allow_subquery: bool) -> Result<()> {
    match expr {
        Expr::Function(f) => {
            let name = object_name_to_string(&f.name).to_ascii_lowercase();
            if NONDETERMINISTIC_FUNCTIONS.contains(&name.as_str()) {
                return Err(ValidatorError::NonDeterministicFunction(name));
            }
            if let FunctionArguments::List(list) = &f.args {
                for arg in &list.args {
                    if let sqlparser::ast::FunctionArg::Unnamed(
                        sqlparser::ast::FunctionArgExpr::Expr(e),
                    ) = arg
                    {
                        scan_expr(e, allow_subquery)?;
                    }
                }
            }
            Ok(())
        }
        Expr::Subquery(_) | Expr::Exists { .. } | Expr::InSubquery { .. } => {
            if allow_subquery {
                Ok(())
            } else {
                Err(ValidatorError::JoinOrSubquery)
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            scan_expr(left, allow_subquery)?;
            scan_expr(right, allow_subquery)
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) | Expr::Cast { expr, .. } => {
            scan_expr(expr, allow_subquery)
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            scan_expr(expr, allow_subquery)?;
            scan_expr(low, allow_subquery)?;
            scan_expr(high, allow_subquery)
        }
        Expr::InList { expr, list, .. } => {
            scan_expr(expr, allow_subquery)?;
            for e in list {
                scan_expr(e, allow_subquery)?;
            }
            Ok(())
        }
        Expr::Value(Value::SingleQuotedString(s)) if s.len() > MAX_TEXT_LENGTH => {
            Err(ValidatorError::TextTooLong(s.len()))
        }
        _ => Ok(()),
    }
}

fn check_no_alias(relation: &TableFactor) -> Result<()> {
    match relation {
        TableFactor::Table { alias: Some(_), .. } => Err(ValidatorError::RelationAlias),
        TableFactor::Table { .. } => Ok(()),
        _ => Err(ValidatorError::JoinOrSubquery),
    }
}

fn single_table_name(from: &[TableWithJoins]) -> Result<ObjectName> {
    if from.len() != 1 || !from[0].joins.is_empty() {
        return Err(ValidatorError::JoinOrSubquery);
    }
    check_no_alias(&from[0].relation)?;
    match &from[0].relation {
        TableFactor::Table { name, .. } => Ok(name.clone()),
        _ => Err(ValidatorError::JoinOrSubquery),
    }
}

//─────────────────────────────
//  CreateStmt
//─────────────────────────────

/// An admitted `CREATE TABLE` statement. Produced once a table is declared;
/// the table id it will be assigned isn't known until the registry insert
/// commits, so the final physical name is filled in by
/// [`CreateStmt::raw_query_for_table_id`].
pub struct CreateStmt {
    chain_id: ChainId,
    prefix: String,
    columns: Vec<ColumnDef>,
    statement: Statement,
}

impl fmt::Debug for CreateStmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateStmt")
            .field("chain_id", &self.chain_id)
            .field("prefix", &self.prefix)
            .field("columns", &self.columns)
            .finish()
    }
}

impl CreateStmt {
    /// The user-chosen table-name component (without the chain/table id
    /// suffix).
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Ordered `(name, type)` column list as declared.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Canonical 32-byte fingerprint of the ordered column schema: hash of
    /// `"col1:type1,col2:type2,…"`. Renaming or reordering a column changes
    /// this value.
    pub fn structure_hash(&self) -> [u8; 32] {
        let canonical = self
            .columns
            .iter()
            .map(|c| format!("{}:{}", c.name, c.col_type.canonical_name()))
            .collect::<Vec<_>>()
            .join(",");
        *blake3::hash(canonical.as_bytes()).as_bytes()
    }

    /// Renders the `CREATE TABLE` statement with its physical name —
    /// `{prefix}_{chain_id}_{table_id}` — substituted in, once the registry
    /// has assigned `table_id`.
    pub fn raw_query_for_table_id(&self, table_id: TableId) -> String {
        let mut stmt = self.statement.clone();
        let physical = format!("{}_{}_{}", self.prefix, self.chain_id.0, table_id.0);
        if let Statement::CreateTable(ct) = &mut stmt {
            ct.name = ObjectName(vec![Ident::new(physical)]);
        }
        stmt.to_string()
    }
}

//─────────────────────────────
//  MutatingStmt
//─────────────────────────────

/// One statement of an admitted multi-statement mutation.
pub enum MutatingStmt {
    /// `INSERT INTO table_id (...) VALUES (...)`.
    Insert { table_id: TableId, statement: Statement },
    /// `UPDATE table_id SET ... WHERE ...`.
    Update {
        table_id: TableId,
        assignments: Vec<Assignment>,
        selection: Option<Expr>,
        statement: Statement,
    },
    /// `DELETE FROM table_id WHERE ...`.
    Delete {
        table_id: TableId,
        selection: Option<Expr>,
        statement: Statement,
    },
    /// `GRANT priv[, priv...] ON table_id TO grantee`.
    Grant {
        table_id: TableId,
        grantee: String,
        privileges: Vec<validator_types::Privilege>,
    },
    /// `REVOKE priv[, priv...] ON table_id FROM grantee`.
    Revoke {
        table_id: TableId,
        grantee: String,
        privileges: Vec<validator_types::Privilege>,
    },
}

impl fmt::Debug for MutatingStmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutatingStmt::Insert { table_id, .. } => {
                f.debug_struct("Insert").field("table_id", table_id).finish()
            }
            MutatingStmt::Update { table_id, .. } => {
                f.debug_struct("Update").field("table_id", table_id).finish()
            }
            MutatingStmt::Delete { table_id, .. } => {
                f.debug_struct("Delete").field("table_id", table_id).finish()
            }
            MutatingStmt::Grant { table_id, grantee, .. } => f
                .debug_struct("Grant")
                .field("table_id", table_id)
                .field("grantee", grantee)
                .finish(),
            MutatingStmt::Revoke { table_id, grantee, .. } => f
                .debug_struct("Revoke")
                .field("table_id", table_id)
                .field("grantee", grantee)
                .finish(),
        }
    }
}

impl MutatingStmt {
    /// The table every statement in the batch was confirmed to target.
    pub fn table_id(&self) -> TableId {
        match self {
            MutatingStmt::Insert { table_id, .. }
            | MutatingStmt::Update { table_id, .. }
            | MutatingStmt::Delete { table_id, .. }
            | MutatingStmt::Grant { table_id, .. }
            | MutatingStmt::Revoke { table_id, .. } => *table_id,
        }
    }

    /// Short operation tag, used for ACL/policy checks
    /// (`check_privileges(caller, table_id, op)`).
    pub fn operation(&self) -> &'static str {
        match self {
            MutatingStmt::Insert { .. } => "INSERT",
            MutatingStmt::Update { .. } => "UPDATE",
            MutatingStmt::Delete { .. } => "DELETE",
            MutatingStmt::Grant { .. } => "GRANT",
            MutatingStmt::Revoke { .. } => "REVOKE",
        }
    }

    /// AND-combines an extra predicate onto the statement's existing
    /// `WHERE` clause (used to apply a controller policy's `where_clause`).
    pub fn add_where_clause(&mut self, extra: Expr) -> Result<()> {
        match self {
            MutatingStmt::Update {
                selection,
                statement,
                ..
            }
            | MutatingStmt::Delete {
                selection,
                statement,
                ..
            } => {
                let combined = match selection.take() {
                    Some(existing) => Expr::BinaryOp {
                        left: Box::new(existing),
                        op: sqlparser::ast::BinaryOperator::And,
                        right: Box::new(extra),
                    },
                    None => extra,
                };
                *selection = Some(combined.clone());
                apply_selection(statement, combined);
                Ok(())
            }
            _ => Err(ValidatorError::StatementIsNotSupported(
                "WHERE clause only applies to UPDATE/DELETE".to_string(),
            )),
        }
    }

    /// Adds a `RETURNING rowid` clause so the executor can capture the set
    /// of affected rows for a controller's `with_check` predicate. Only
    /// used internally by the executor; never surfaced to the on-chain
    /// caller (`RETURNING` in the original statement is rejected at
    /// validation time).
    pub fn add_returning_clause(&mut self) -> Result<()> {
        let returning = Some(vec![SelectItem::UnnamedExpr(Expr::Identifier(Ident::new(
            "rowid",
        )))]);
        match self {
            MutatingStmt::Insert { statement, .. } => set_returning(statement, returning),
            MutatingStmt::Update { statement, .. } => set_returning(statement, returning),
            MutatingStmt::Delete { statement, .. } => set_returning(statement, returning),
            _ => {
                return Err(ValidatorError::StatementIsNotSupported(
                    "RETURNING only applies to INSERT/UPDATE/DELETE".to_string(),
                ))
            }
        }
        Ok(())
    }

    /// Rewrites the statement's table reference to `physical_name`.
    pub fn rewrite_table_name(&mut self, physical_name: &str) {
        let name = ObjectName(vec![Ident::new(physical_name)]);
        let statement = match self {
            MutatingStmt::Insert { statement, .. }
            | MutatingStmt::Update { statement, .. }
            | MutatingStmt::Delete { statement, .. } => statement,
            MutatingStmt::Grant { .. } | MutatingStmt::Revoke { .. } => return,
        };
        set_table_name(statement, name);
    }

    /// Renders the current (possibly rewritten) statement back to SQL text.
    pub fn get_sql(&self) -> String {
        match self {
            MutatingStmt::Insert { statement, .. }
            | MutatingStmt::Update { statement, .. }
            | MutatingStmt::Delete { statement, .. } => statement.to_string(),
            MutatingStmt::Grant {
                table_id,
                grantee,
                privileges,
            }
            | MutatingStmt::Revoke {
                table_id,
                grantee,
                privileges,
            } => {
                let verb = if matches!(self, MutatingStmt::Grant { .. }) {
                    "GRANT"
                } else {
                    "REVOKE"
                };
                let privs = privileges
                    .iter()
                    .map(|p| match p {
                        validator_types::Privilege::Insert => "INSERT",
                        validator_types::Privilege::Update => "UPDATE",
                        validator_types::Privilege::Delete => "DELETE",
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{verb} {privs} ON {} {} {grantee}", table_id.0, if verb == "GRANT" { "TO" } else { "FROM" })
            }
        }
    }
}

fn apply_selection(statement: &mut Statement, selection: Expr) {
    match statement {
        Statement::Update { selection: s, .. } => *s = Some(selection),
        Statement::Delete(d) => d.selection = Some(selection),
        _ => {}
    }
}

fn set_returning(statement: &mut Statement, returning: Option<Vec<SelectItem>>) {
    match statement {
        Statement::Insert(i) => i.returning = returning,
        Statement::Update { returning: r, .. } => *r = returning,
        Statement::Delete(d) => d.returning = returning,
        _ => {}
    }
}

fn set_table_name(statement: &mut Statement, name: ObjectName) {
    match statement {
        Statement::Insert(i) => i.table_name = name,
        Statement::Update { table, .. } => {
            if let TableFactor::Table { name: n, .. } = &mut table.relation {
                *n = name;
            }
        }
        Statement::Delete(d) => {
            if let Some(t) = d.tables.first_mut() {
                *t = name;
            } else if let sqlparser::ast::FromTable::WithFromKeyword(from)
            | sqlparser::ast::FromTable::WithoutKeyword(from) = &mut d.from
            {
                if let Some(t) = from.first_mut() {
                    if let TableFactor::Table { name: n, .. } = &mut t.relation {
                        *n = name;
                    }
                }
            }
        }
        _ => {}
    }
}

//─────────────────────────────
//  ReadStmt
//─────────────────────────────

/// An admitted, single top-level `SELECT`. Joins and subqueries are
/// permitted here — only mutations need the deterministic-execution
/// guarantees that rule them out.
#[derive(Debug)]
pub struct ReadStmt {
    statement: Statement,
}

impl ReadStmt {
    /// Renders the (rewritten) query back to SQL text.
    pub fn get_sql(&self) -> String {
        self.statement.to_string()
    }
}

//─────────────────────────────
//  SqlValidator
//─────────────────────────────

/// Stateless, shareable entry point for statement admission. Holds no
/// mutable state and no I/O handle — constructing one is free.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlValidator;

impl SqlValidator {
    /// Admits exactly one `CREATE TABLE prefix_{chain_id} (...)` statement.
    pub fn validate_create_table(&self, sql: &str, chain_id: ChainId) -> Result<CreateStmt> {
        let mut statements = parse(sql)?;
        if statements.is_empty() {
            return Err(ValidatorError::EmptyStatement);
        }
        if statements.len() != 1 {
            return Err(ValidatorError::NoSingleStatement);
        }
        let statement = statements.remove(0);
        let Statement::CreateTable(ct) = &statement else {
            return Err(ValidatorError::NoTopLevelCreate);
        };
        let name = object_name_to_string(&ct.name);
        let (prefix, name_chain, table_id) =
            split_table_name(&name).ok_or_else(|| ValidatorError::InvalidTableName(name.clone()))?;
        if table_id.is_some() {
            return Err(ValidatorError::InvalidTableName(format!(
                "{name}: CREATE TABLE must not name a table id"
            )));
        }
        if name_chain != chain_id.0 {
            return Err(ValidatorError::InvalidTableName(format!(
                "{name}: chain id {name_chain} does not match {}",
                chain_id.0
            )));
        }
        reject_reserved_prefix(&prefix)?;
        if ct.columns.len() > MAX_COLUMNS {
            return Err(ValidatorError::TooManyColumns(ct.columns.len()));
        }
        let columns = ct
            .columns
            .iter()
            .map(column_def_from_ast)
            .collect::<Result<Vec<_>>>()?;

        Ok(CreateStmt {
            chain_id,
            prefix,
            columns,
            statement,
        })
    }

    /// Admits a 1..N statement batch, every statement targeting the same
    /// physical table.
    pub fn validate_mutating_query(
        &self,
        sql: &str,
        chain_id: ChainId,
    ) -> Result<Vec<MutatingStmt>> {
        let statements = parse(sql)?;
        if statements.is_empty() {
            return Err(ValidatorError::EmptyStatement);
        }
        let mut out = Vec::with_capacity(statements.len());
        let mut common_table: Option<TableId> = None;
        for statement in statements {
            let mutating = validate_one_mutation(statement, chain_id)?;
            match common_table {
                None => common_table = Some(mutating.table_id()),
                Some(t) if t == mutating.table_id() => {}
                Some(_) => return Err(ValidatorError::MultiTableReference),
            }
            out.push(mutating);
        }
        Ok(out)
    }

    /// Admits a single top-level `SELECT`.
    pub fn validate_read_query(&self, sql: &str) -> Result<ReadStmt> {
        if sql.len() > MAX_READ_QUERY_SIZE {
            return Err(ValidatorError::QueryTooLong(sql.len()));
        }
        let mut statements = parse(sql)?;
        if statements.is_empty() {
            return Err(ValidatorError::EmptyStatement);
        }
        if statements.len() != 1 {
            return Err(ValidatorError::NoSingleStatement);
        }
        let statement = statements.remove(0);
        let Statement::Query(query) = &statement else {
            return Err(ValidatorError::NoTopLevelSelect);
        };
        reject_locking_clause(query)?;
        Ok(ReadStmt { statement })
    }
}

fn column_def_from_ast(c: &AstColumnDef) -> Result<ColumnDef> {
    Ok(ColumnDef {
        name: c.name.value.clone(),
        col_type: data_type_to_column_type(&c.data_type)?,
    })
}

fn reject_locking_clause(query: &Query) -> Result<()> {
    if !query.locks.is_empty() {
        return Err(ValidatorError::StatementIsNotSupported(
            "FOR UPDATE / FOR SHARE is not permitted".to_string(),
        ));
    }
    Ok(())
}

fn validate_one_mutation(statement: Statement, chain_id: ChainId) -> Result<MutatingStmt> {
    match &statement {
        Statement::Insert(insert) => {
            if insert.returning.is_some() {
                return Err(ValidatorError::ReturningClause);
            }
            let table_id = table_id_for(&insert.table_name, chain_id)?;
            if let Some(source) = &insert.source {
                scan_query_values(source)?;
            }
            Ok(MutatingStmt::Insert { table_id, statement })
        }
        Statement::Update {
            table,
            assignments,
            selection,
            returning,
            from,
            ..
        } => {
            if returning.is_some() {
                return Err(ValidatorError::ReturningClause);
            }
            if from.is_some() {
                return Err(ValidatorError::JoinOrSubquery);
            }
            check_no_alias(&table.relation)?;
            if !table.joins.is_empty() {
                return Err(ValidatorError::JoinOrSubquery);
            }
            let name = match &table.relation {
                TableFactor::Table { name, .. } => name.clone(),
                _ => return Err(ValidatorError::JoinOrSubquery),
            };
            let table_id = table_id_for(&name, chain_id)?;
            for a in assignments {
                scan_expr(&a.value, false)?;
            }
            if let Some(s) = selection {
                scan_expr(s, false)?;
            }
            Ok(MutatingStmt::Update {
                table_id,
                assignments: assignments.clone(),
                selection: selection.clone(),
                statement,
            })
        }
        Statement::Delete(delete) => {
            if delete.returning.is_some() {
                return Err(ValidatorError::ReturningClause);
            }
            let from = match &delete.from {
                sqlparser::ast::FromTable::WithFromKeyword(f)
                | sqlparser::ast::FromTable::WithoutKeyword(f) => f,
            };
            let name = single_table_name(from)?;
            let table_id = table_id_for(&name, chain_id)?;
            if let Some(s) = &delete.selection {
                scan_expr(s, false)?;
            }
            Ok(MutatingStmt::Delete {
                table_id,
                selection: delete.selection.clone(),
                statement,
            })
        }
        Statement::Grant {
            privileges,
            objects,
            grantees,
            ..
        } => {
            let (table_id, privs) = grant_revoke_fields(privileges, objects, chain_id)?;
            let grantee = eth_address_of(grantees)?;
            Ok(MutatingStmt::Grant {
                table_id,
                grantee,
                privileges: privs,
            })
        }
        Statement::Revoke {
            privileges,
            objects,
            grantees,
            ..
        } => {
            let (table_id, privs) = grant_revoke_fields(privileges, objects, chain_id)?;
            let grantee = eth_address_of(grantees)?;
            Ok(MutatingStmt::Revoke {
                table_id,
                grantee,
                privileges: privs,
            })
        }
        other => Err(ValidatorError::NoTopLevelWriteOrGrant.with_context(other)),
    }
}

/// Small trait purely to attach statement-kind context to the generic
/// "not a write or grant" error without duplicating the match arms above.
trait WithContext {
    fn with_context(self, _stmt: &Statement) -> Self;
}
impl WithContext for ValidatorError {
    fn with_context(self, _stmt: &Statement) -> Self {
        self
    }
}

fn table_id_for(name: &ObjectName, chain_id: ChainId) -> Result<TableId> {
    let name_str = object_name_to_string(name);
    let (prefix, name_chain, table_id) = split_table_name(&name_str)
        .ok_or_else(|| ValidatorError::InvalidTableName(name_str.clone()))?;
    reject_reserved_prefix(&prefix)?;
    if name_chain != chain_id.0 {
        return Err(ValidatorError::InvalidTableName(format!(
            "{name_str}: chain id {name_chain} does not match {}",
            chain_id.0
        )));
    }
    let table_id =
        table_id.ok_or_else(|| ValidatorError::InvalidTableName(format!("{name_str}: missing table id")))?;
    Ok(TableId(table_id))
}

fn scan_query_values(query: &Query) -> Result<()> {
    if let SetExpr::Values(values) = query.body.as_ref() {
        for row in &values.rows {
            for expr in row {
                scan_expr(expr, false)?;
            }
        }
        Ok(())
    } else {
        // An INSERT ... SELECT body is a subquery in all but name.
        Err(ValidatorError::JoinOrSubquery)
    }
}

fn grant_revoke_fields(
    privileges: &Privileges,
    objects: &Option<GrantObjects>,
    chain_id: ChainId,
) -> Result<(TableId, Vec<validator_types::Privilege>)> {
    let Privileges::Actions(actions) = privileges else {
        return Err(ValidatorError::AllPrivilegesNotAllowed);
    };
    if actions.len() > MAX_GRANT_PRIVILEGES {
        return Err(ValidatorError::NoInsertUpdateDeletePrivilege(
            "too many privileges named".to_string(),
        ));
    }
    let mut privs = Vec::with_capacity(actions.len());
    for action in actions {
        let name = format!("{action}").to_ascii_uppercase();
        let privilege = match name.as_str() {
            "INSERT" => validator_types::Privilege::Insert,
            "UPDATE" => validator_types::Privilege::Update,
            "DELETE" => validator_types::Privilege::Delete,
            other => return Err(ValidatorError::NoInsertUpdateDeletePrivilege(other.to_string())),
        };
        privs.push(privilege);
    }
    let names = match objects {
        Some(GrantObjects::Tables(names)) if names.len() == 1 => names,
        Some(GrantObjects::Tables(_)) => return Err(ValidatorError::MultiTableReference),
        _ => {
            return Err(ValidatorError::StatementIsNotSupported(
                "GRANT/REVOKE must target exactly one table".to_string(),
            ))
        }
    };
    let table_id = table_id_for(&names[0], chain_id)?;
    Ok((table_id, privs))
}

fn eth_address_of(grantees: &[sqlparser::ast::Grantee]) -> Result<String> {
    if grantees.len() != 1 {
        return Err(ValidatorError::RoleIsNotAnEthAddress(
            "exactly one grantee is required".to_string(),
        ));
    }
    let raw = format!("{}", grantees[0]);
    let candidate = raw.trim_matches('"').to_ascii_lowercase();
    let is_address = candidate.len() == 42
        && candidate.starts_with("0x")
        && candidate[2..].chars().all(|c| c.is_ascii_hexdigit());
    if !is_address {
        return Err(ValidatorError::RoleIsNotAnEthAddress(candidate));
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAIN: ChainId = ChainId(1337);

    #[test]
    fn admits_a_simple_create_table() {
        let v = SqlValidator;
        let stmt = v
            .validate_create_table("CREATE TABLE foo_1337 (a INT, b TEXT)", CHAIN)
            .expect("should validate");
        assert_eq!(stmt.prefix(), "foo");
        assert_eq!(stmt.columns().len(), 2);
        let rendered = stmt.raw_query_for_table_id(TableId(1));
        assert!(rendered.contains("foo_1337_1"));
    }

    #[test]
    fn rejects_reserved_prefix() {
        let v = SqlValidator;
        let err = v
            .validate_create_table("CREATE TABLE system_foo_1337 (a INT)", CHAIN)
            .unwrap_err();
        assert!(matches!(err, ValidatorError::SystemTableReferencing(_)));
    }

    #[test]
    fn rejects_mismatched_chain_id() {
        let v = SqlValidator;
        let err = v
            .validate_create_table("CREATE TABLE foo_7 (a INT)", CHAIN)
            .unwrap_err();
        assert!(matches!(err, ValidatorError::InvalidTableName(_)));
    }

    #[test]
    fn structure_hash_is_order_sensitive() {
        let v = SqlValidator;
        let a = v
            .validate_create_table("CREATE TABLE foo_1337 (a INT, b TEXT)", CHAIN)
            .unwrap();
        let b = v
            .validate_create_table("CREATE TABLE foo_1337 (b TEXT, a INT)", CHAIN)
            .unwrap();
        assert_ne!(a.structure_hash(), b.structure_hash());
    }

    #[test]
    fn admits_single_table_insert() {
        let v = SqlValidator;
        let stmts = v
            .validate_mutating_query("INSERT INTO foo_1337_1 VALUES (1, 'x')", CHAIN)
            .unwrap();
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].table_id(), TableId(1));
        assert_eq!(stmts[0].operation(), "INSERT");
    }

    #[test]
    fn rejects_cross_table_batch() {
        let v = SqlValidator;
        let err = v
            .validate_mutating_query(
                "INSERT INTO foo_1337_1 VALUES (1); INSERT INTO foo_1337_2 VALUES (2)",
                CHAIN,
            )
            .unwrap_err();
        assert!(matches!(err, ValidatorError::MultiTableReference));
    }

    #[test]
    fn rejects_non_deterministic_function() {
        let v = SqlValidator;
        let err = v
            .validate_mutating_query(
                "UPDATE foo_1337_1 SET a = CURRENT_TIMESTAMP WHERE a = 1",
                CHAIN,
            )
            .unwrap_err();
        assert!(matches!(err, ValidatorError::NonDeterministicFunction(_)));
    }

    #[test]
    fn rejects_returning_clause() {
        let v = SqlValidator;
        let err = v
            .validate_mutating_query("DELETE FROM foo_1337_1 WHERE a = 1 RETURNING a", CHAIN)
            .unwrap_err();
        assert!(matches!(err, ValidatorError::ReturningClause));
    }

    #[test]
    fn admits_join_in_read_query() {
        let v = SqlValidator;
        let stmt = v
            .validate_read_query(
                "SELECT * FROM foo_1337_1 a JOIN bar_1337_2 b ON a.id = b.id",
            )
            .unwrap();
        assert!(stmt.get_sql().contains("JOIN"));
    }

    #[test]
    fn rejects_locking_read_query() {
        let v = SqlValidator;
        let err = v
            .validate_read_query("SELECT * FROM foo_1337_1 FOR UPDATE")
            .unwrap_err();
        assert!(matches!(err, ValidatorError::StatementIsNotSupported(_)));
    }

    #[test]
    fn rejects_address_like_grantee_missing() {
        let v = SqlValidator;
        let err = v
            .validate_mutating_query(
                "GRANT INSERT, UPDATE ON foo_1337_1 TO not_an_address",
                CHAIN,
            )
            .unwrap_err();
        assert!(matches!(err, ValidatorError::RoleIsNotAnEthAddress(_)));
    }
}
