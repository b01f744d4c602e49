//! In-process reference driver.
//!
//! Tables live in memory and are created through [`MemoryDatabase`] rather
//! than DDL. Statements understand the shapes the table gateway emits:
//!
//! - `insert into t(a,b) values(?,?)[,(?,?)...]`
//! - `insert into t default values`
//! - `update t set a=?,b=? where c=? [and d=?...]`
//! - `delete from t where c=? [and d=?...]`
//! - `select * from t [where c=? [and d=?...]] [order by c]`
//! - `call proc(?,...)`

mod sql;
mod statement;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, warn};

use super::{
    ColumnDescriptor, Connection, ConnectionToken, DatabaseMetadata, PrepareOptions, Savepoint,
    Statement, TableDescriptor,
};
use crate::core::{ColumnMeta, DbError, DbResult, SqlType, Value};

pub use statement::{MemoryResultSet, MemoryStatement};

use sql::Command;
use statement::compare_values;

pub const TABLE_TYPES: [&str; 3] = ["TABLE", "VIEW", "SYSTEM TABLE"];

type Procedure = Arc<dyn Fn(&[Value]) -> DbResult<u64> + Send + Sync>;

// ============================================================================
// Column and table definitions
// ============================================================================

/// Column definition for [`MemoryDatabase::create_table`].
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryColumn {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub auto_increment: bool,
    pub default: Option<Value>,
}

impl MemoryColumn {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            nullable: true,
            auto_increment: false,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Filled from a per-table sequence when inserted as NULL or omitted.
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self.nullable = false;
        self
    }

    /// Used when the column is left out of an insert.
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

#[derive(Debug, Clone)]
struct TableData {
    schema: Option<String>,
    name: String,
    table_type: String,
    columns: Vec<MemoryColumn>,
    rows: Vec<Vec<Value>>,
    next_id: i64,
}

impl TableData {
    fn column_index(&self, name: &str) -> DbResult<usize> {
        self.columns
            .iter()
            .position(|column| column.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                DbError::Execution(format!("Column '{}' does not exist in table '{}'", name, self.name))
            })
    }

    fn column_metas(&self) -> Vec<ColumnMeta> {
        self.columns
            .iter()
            .map(|column| ColumnMeta::new(column.name.clone(), column.sql_type))
            .collect()
    }

    fn matches(&self, row: &[Value], filter: &[(usize, Value)]) -> bool {
        // NULL never equals anything
        filter
            .iter()
            .all(|(index, value)| !value.is_null() && row[*index] == *value)
    }

    fn filter(&self, conditions: &[String], params: &[Value]) -> DbResult<Vec<(usize, Value)>> {
        conditions
            .iter()
            .zip(params)
            .map(|(column, value)| -> DbResult<(usize, Value)> {
                Ok((self.column_index(column)?, value.clone()))
            })
            .collect()
    }
}

#[derive(Default)]
struct DatabaseState {
    tables: Vec<TableData>,
    procedures: Vec<(String, Procedure)>,
    failing_closes: HashSet<String>,
}

impl DatabaseState {
    fn table_mut(&mut self, qualified: &str) -> DbResult<&mut TableData> {
        let (schema, name) = match qualified.split_once('.') {
            Some((schema, name)) => (Some(schema), name),
            None => (None, qualified),
        };

        self.tables
            .iter_mut()
            .find(|table| {
                table.name.eq_ignore_ascii_case(name)
                    && match (schema, &table.schema) {
                        (None, _) => true,
                        (Some(wanted), Some(actual)) => wanted.eq_ignore_ascii_case(actual),
                        (Some(_), None) => false,
                    }
            })
            .ok_or_else(|| DbError::Execution(format!("Table '{}' does not exist", qualified)))
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Counters of driver-level activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriverStats {
    pub prepared: u64,
    pub closed: u64,
    pub executed: u64,
}

#[derive(Default)]
struct StatsCounters {
    prepared: AtomicU64,
    closed: AtomicU64,
    executed: AtomicU64,
}

// ============================================================================
// MemoryDatabase
// ============================================================================

/// Shared in-memory database. Clones refer to the same data.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<DatabaseState>>,
    stats: Arc<StatsCounters>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table named `"table"` or `"schema.table"`. Names keep the
    /// given case.
    pub fn create_table(&self, qualified: &str, columns: Vec<MemoryColumn>) -> DbResult<()> {
        self.create_relation(qualified, "TABLE", columns)
    }

    pub fn create_view(&self, qualified: &str, columns: Vec<MemoryColumn>) -> DbResult<()> {
        self.create_relation(qualified, "VIEW", columns)
    }

    fn create_relation(&self, qualified: &str, table_type: &str, columns: Vec<MemoryColumn>) -> DbResult<()> {
        let mut state = self.state.lock()?;
        if state.table_mut(qualified).is_ok() {
            return Err(DbError::Execution(format!("Table '{}' already exists", qualified)));
        }

        let (schema, name) = match qualified.split_once('.') {
            Some((schema, name)) => (Some(schema.to_string()), name.to_string()),
            None => (None, qualified.to_string()),
        };

        debug!(table = qualified, table_type, columns = columns.len(), "Created memory table");
        state.tables.push(TableData {
            schema,
            name,
            table_type: table_type.to_string(),
            columns,
            rows: Vec::new(),
            next_id: 1,
        });
        Ok(())
    }

    /// Register a procedure callable as `call name(?,...)`.
    pub fn register_procedure<F>(&self, name: &str, procedure: F) -> DbResult<()>
    where
        F: Fn(&[Value]) -> DbResult<u64> + Send + Sync + 'static,
    {
        let mut state = self.state.lock()?;
        state.procedures.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
        state.procedures.push((name.to_string(), Arc::new(procedure)));
        Ok(())
    }

    /// Make `close()` of statements with exactly this SQL fail. The statement
    /// is still closed.
    pub fn fail_close_for(&self, sql: &str) -> DbResult<()> {
        self.state.lock()?.failing_closes.insert(sql.to_string());
        Ok(())
    }

    /// Rows of a table in insertion order.
    pub fn rows(&self, qualified: &str) -> DbResult<Vec<Vec<Value>>> {
        let mut state = self.state.lock()?;
        Ok(state.table_mut(qualified)?.rows.clone())
    }

    pub fn row_count(&self, qualified: &str) -> DbResult<usize> {
        let mut state = self.state.lock()?;
        Ok(state.table_mut(qualified)?.rows.len())
    }

    pub fn stats(&self) -> DriverStats {
        DriverStats {
            prepared: self.stats.prepared.load(Ordering::Relaxed),
            closed: self.stats.closed.load(Ordering::Relaxed),
            executed: self.stats.executed.load(Ordering::Relaxed),
        }
    }

    /// Open a new physical connection.
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection::new(self.clone())
    }

    pub fn metadata(&self) -> MemoryMetadata {
        MemoryMetadata { db: self.clone() }
    }

    fn prepare(&self, sql: &str, return_keys: bool, connection_closed: Arc<AtomicBool>) -> DbResult<MemoryStatement> {
        let command = Command::parse(sql)?;
        self.stats.prepared.fetch_add(1, Ordering::Relaxed);
        Ok(MemoryStatement::new(self.clone(), sql, command, return_keys, connection_closed))
    }

    fn record_execution(&self) {
        self.stats.executed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_close(&self, sql: &str) -> DbResult<()> {
        self.stats.closed.fetch_add(1, Ordering::Relaxed);
        if self.state.lock()?.failing_closes.contains(sql) {
            warn!(sql, "Injected statement close failure");
            return Err(DbError::Execution(format!("injected close failure for '{}'", sql)));
        }
        Ok(())
    }

    fn snapshot(&self) -> DbResult<Vec<TableData>> {
        Ok(self.state.lock()?.tables.clone())
    }

    fn restore(&self, tables: Vec<TableData>) -> DbResult<()> {
        self.state.lock()?.tables = tables;
        Ok(())
    }

    fn insert(
        &self,
        qualified: &str,
        columns: &[String],
        rows: usize,
        params: &[Value],
    ) -> DbResult<(Vec<ColumnMeta>, Vec<Vec<Value>>)> {
        let mut state = self.state.lock()?;
        let table = state.table_mut(qualified)?;
        let indexes = columns
            .iter()
            .map(|column| table.column_index(column))
            .collect::<DbResult<Vec<_>>>()?;

        let width = columns.len();
        let mut inserted = Vec::with_capacity(rows);
        for r in 0..rows {
            let chunk = params
                .get(r * width..(r + 1) * width)
                .ok_or_else(|| DbError::Execution(format!("missing parameters for row {} of '{}'", r + 1, qualified)))?;
            let mut row = vec![Value::Null; table.columns.len()];
            let mut supplied = vec![false; table.columns.len()];
            for (index, value) in indexes.iter().zip(chunk) {
                row[*index] = value.clone();
                supplied[*index] = true;
            }

            for (i, column) in table.columns.iter().enumerate() {
                if column.auto_increment {
                    match row[i].as_i64() {
                        Some(explicit) => table.next_id = table.next_id.max(explicit + 1),
                        None if row[i].is_null() => {
                            row[i] = Value::Long(table.next_id);
                            table.next_id += 1;
                        }
                        None => {}
                    }
                } else if !supplied[i] {
                    if let Some(default) = &column.default {
                        row[i] = default.clone();
                    }
                }

                if row[i].is_null() && !column.nullable {
                    return Err(DbError::Constraint(format!(
                        "Column '{}' of table '{}' cannot be NULL",
                        column.name, table.name
                    )));
                }
            }
            inserted.push(row);
        }

        table.rows.extend(inserted.iter().cloned());
        Ok((table.column_metas(), inserted))
    }

    fn update(
        &self,
        qualified: &str,
        assignments: &[String],
        conditions: &[String],
        values: &[Value],
        filter: &[Value],
    ) -> DbResult<u64> {
        let mut state = self.state.lock()?;
        let table = state.table_mut(qualified)?;
        let targets = assignments
            .iter()
            .map(|column| table.column_index(column))
            .collect::<DbResult<Vec<_>>>()?;
        let filter = table.filter(conditions, filter)?;

        for (index, value) in targets.iter().zip(values) {
            if value.is_null() && !table.columns[*index].nullable {
                return Err(DbError::Constraint(format!(
                    "Column '{}' of table '{}' cannot be NULL",
                    table.columns[*index].name, table.name
                )));
            }
        }

        let mut count = 0;
        let matching: Vec<usize> = table
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| table.matches(row, &filter))
            .map(|(i, _)| i)
            .collect();
        for row in matching {
            for (index, value) in targets.iter().zip(values) {
                table.rows[row][*index] = value.clone();
            }
            count += 1;
        }
        Ok(count)
    }

    fn delete(&self, qualified: &str, conditions: &[String], params: &[Value]) -> DbResult<u64> {
        let mut state = self.state.lock()?;
        let table = state.table_mut(qualified)?;
        let filter = table.filter(conditions, params)?;

        let before = table.rows.len();
        let rows = std::mem::take(&mut table.rows);
        table.rows = rows.into_iter().filter(|row| !table.matches(row, &filter)).collect();
        Ok((before - table.rows.len()) as u64)
    }

    fn select(
        &self,
        qualified: &str,
        conditions: &[String],
        params: &[Value],
        order_by: Option<&str>,
    ) -> DbResult<(Vec<ColumnMeta>, Vec<Vec<Value>>)> {
        let mut state = self.state.lock()?;
        let table = state.table_mut(qualified)?;
        let filter = table.filter(conditions, params)?;

        let mut rows: Vec<Vec<Value>> = table
            .rows
            .iter()
            .filter(|row| table.matches(row, &filter))
            .cloned()
            .collect();

        if let Some(column) = order_by {
            let index = table.column_index(column)?;
            rows.sort_by(|a, b| compare_values(&a[index], &b[index]));
        }

        Ok((table.column_metas(), rows))
    }

    fn call(&self, name: &str, params: &[Value]) -> DbResult<u64> {
        let procedure = {
            let state = self.state.lock()?;
            state
                .procedures
                .iter()
                .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
                .map(|(_, procedure)| Arc::clone(procedure))
                .ok_or_else(|| DbError::Execution(format!("Procedure '{}' does not exist", name)))?
        };
        procedure(params)
    }
}

// ============================================================================
// MemoryConnection
// ============================================================================

/// One physical connection to a [`MemoryDatabase`].
///
/// Transactions snapshot the whole database, so concurrent writers on other
/// connections are rolled back with it.
pub struct MemoryConnection {
    db: MemoryDatabase,
    token: ConnectionToken,
    closed: Arc<AtomicBool>,
    auto_commit: bool,
    transaction: Option<Vec<TableData>>,
    savepoints: Vec<(Savepoint, Vec<TableData>)>,
    next_savepoint: u64,
}

impl MemoryConnection {
    fn new(db: MemoryDatabase) -> Self {
        let token = ConnectionToken::mint();
        debug!(%token, "Opened memory connection");
        Self {
            db,
            token,
            closed: Arc::new(AtomicBool::new(false)),
            auto_commit: true,
            transaction: None,
            savepoints: Vec::new(),
            next_savepoint: 1,
        }
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::ConnectionClosed);
        }
        Ok(())
    }

    fn ensure_transaction(&self) -> DbResult<()> {
        self.ensure_open()?;
        if self.auto_commit {
            return Err(DbError::Execution("no transaction is active (auto-commit is on)".into()));
        }
        Ok(())
    }

    fn begin(&mut self) -> DbResult<()> {
        self.transaction = Some(self.db.snapshot()?);
        self.savepoints.clear();
        Ok(())
    }
}

impl Connection for MemoryConnection {
    fn physical_token(&self) -> Option<ConnectionToken> {
        Some(self.token)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn prepare(&mut self, sql: &str, options: PrepareOptions) -> DbResult<Box<dyn Statement>> {
        self.ensure_open()?;
        let statement = self
            .db
            .prepare(sql, options.return_generated_keys, Arc::clone(&self.closed))?;
        Ok(Box::new(statement))
    }

    fn prepare_call(&mut self, sql: &str) -> DbResult<Box<dyn Statement>> {
        self.ensure_open()?;
        if !matches!(Command::parse(sql)?, Command::Call { .. }) {
            return Err(DbError::Unsupported(format!("'{}' is not a procedure call", sql)));
        }
        let statement = self.db.prepare(sql, false, Arc::clone(&self.closed))?;
        Ok(Box::new(statement))
    }

    fn metadata(&self) -> DbResult<Box<dyn DatabaseMetadata + '_>> {
        self.ensure_open()?;
        Ok(Box::new(self.db.metadata()))
    }

    fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> DbResult<()> {
        self.ensure_open()?;
        if auto_commit == self.auto_commit {
            return Ok(());
        }
        self.auto_commit = auto_commit;
        if auto_commit {
            self.transaction = None;
            self.savepoints.clear();
            Ok(())
        } else {
            self.begin()
        }
    }

    fn commit(&mut self) -> DbResult<()> {
        self.ensure_transaction()?;
        self.begin()
    }

    fn rollback(&mut self) -> DbResult<()> {
        self.ensure_transaction()?;
        if let Some(snapshot) = self.transaction.take() {
            self.db.restore(snapshot)?;
        }
        self.begin()
    }

    fn set_savepoint(&mut self, name: Option<&str>) -> DbResult<Savepoint> {
        self.ensure_transaction()?;
        let savepoint = Savepoint {
            id: self.next_savepoint,
            name: name.map(str::to_string),
        };
        self.next_savepoint += 1;
        self.savepoints.push((savepoint.clone(), self.db.snapshot()?));
        Ok(savepoint)
    }

    fn rollback_to_savepoint(&mut self, savepoint: &Savepoint) -> DbResult<()> {
        self.ensure_transaction()?;
        let position = self
            .savepoints
            .iter()
            .position(|(existing, _)| existing == savepoint)
            .ok_or_else(|| DbError::Execution(format!("Unknown savepoint {}", savepoint.id)))?;

        // The savepoint itself stays valid
        self.savepoints.truncate(position + 1);
        let snapshot = self.savepoints[position].1.clone();
        self.db.restore(snapshot)
    }

    fn release_savepoint(&mut self, savepoint: &Savepoint) -> DbResult<()> {
        self.ensure_transaction()?;
        let position = self
            .savepoints
            .iter()
            .position(|(existing, _)| existing == savepoint)
            .ok_or_else(|| DbError::Execution(format!("Unknown savepoint {}", savepoint.id)))?;
        self.savepoints.truncate(position);
        Ok(())
    }

    fn close(&mut self) -> DbResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(token = %self.token, "Closed memory connection");
        }
        self.transaction = None;
        self.savepoints.clear();
        Ok(())
    }
}

// ============================================================================
// MemoryPool
// ============================================================================

/// Hands out a fresh wrapper per checkout over a fixed set of physical
/// connections.
pub struct MemoryPool {
    db: MemoryDatabase,
    physical: Vec<Arc<Mutex<MemoryConnection>>>,
    next: AtomicUsize,
}

impl MemoryPool {
    pub fn new(db: &MemoryDatabase, size: usize) -> Self {
        let physical = (0..size.max(1))
            .map(|_| Arc::new(Mutex::new(db.connect())))
            .collect();
        Self {
            db: db.clone(),
            physical,
            next: AtomicUsize::new(0),
        }
    }

    /// Next physical connection, round-robin.
    pub fn checkout(&self) -> DbResult<PooledConnection> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.physical.len();
        let inner = Arc::clone(&self.physical[index]);
        let token = inner.lock()?.token;
        Ok(PooledConnection {
            db: self.db.clone(),
            inner,
            token,
            released: false,
        })
    }

    pub fn size(&self) -> usize {
        self.physical.len()
    }
}

/// A checkout from a [`MemoryPool`]. Closing it releases the wrapper; the
/// physical connection stays open.
pub struct PooledConnection {
    db: MemoryDatabase,
    inner: Arc<Mutex<MemoryConnection>>,
    token: ConnectionToken,
    released: bool,
}

impl PooledConnection {
    fn with_inner<R>(&self, f: impl FnOnce(&mut MemoryConnection) -> DbResult<R>) -> DbResult<R> {
        if self.released {
            return Err(DbError::ConnectionClosed);
        }
        let mut inner = self.inner.lock()?;
        f(&mut inner)
    }
}

impl Connection for PooledConnection {
    fn physical_token(&self) -> Option<ConnectionToken> {
        Some(self.token)
    }

    fn is_closed(&self) -> bool {
        self.released || self.inner.lock().map(|inner| inner.is_closed()).unwrap_or(true)
    }

    fn prepare(&mut self, sql: &str, options: PrepareOptions) -> DbResult<Box<dyn Statement>> {
        self.with_inner(|inner| inner.prepare(sql, options))
    }

    fn prepare_call(&mut self, sql: &str) -> DbResult<Box<dyn Statement>> {
        self.with_inner(|inner| inner.prepare_call(sql))
    }

    fn metadata(&self) -> DbResult<Box<dyn DatabaseMetadata + '_>> {
        if self.is_closed() {
            return Err(DbError::ConnectionClosed);
        }
        Ok(Box::new(self.db.metadata()))
    }

    fn auto_commit(&self) -> bool {
        self.with_inner(|inner| Ok(inner.auto_commit())).unwrap_or(true)
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> DbResult<()> {
        self.with_inner(|inner| inner.set_auto_commit(auto_commit))
    }

    fn commit(&mut self) -> DbResult<()> {
        self.with_inner(|inner| inner.commit())
    }

    fn rollback(&mut self) -> DbResult<()> {
        self.with_inner(|inner| inner.rollback())
    }

    fn set_savepoint(&mut self, name: Option<&str>) -> DbResult<Savepoint> {
        self.with_inner(|inner| inner.set_savepoint(name))
    }

    fn rollback_to_savepoint(&mut self, savepoint: &Savepoint) -> DbResult<()> {
        self.with_inner(|inner| inner.rollback_to_savepoint(savepoint))
    }

    fn release_savepoint(&mut self, savepoint: &Savepoint) -> DbResult<()> {
        self.with_inner(|inner| inner.release_savepoint(savepoint))
    }

    fn close(&mut self) -> DbResult<()> {
        self.released = true;
        Ok(())
    }
}

// ============================================================================
// Metadata
// ============================================================================

pub struct MemoryMetadata {
    db: MemoryDatabase,
}

impl DatabaseMetadata for MemoryMetadata {
    fn table_types(&self) -> DbResult<Vec<String>> {
        Ok(TABLE_TYPES.iter().map(|t| t.to_string()).collect())
    }

    fn tables(&self, schema: Option<&str>, types: &[String]) -> DbResult<Vec<TableDescriptor>> {
        let state = self.db.state.lock()?;
        Ok(state
            .tables
            .iter()
            .filter(|table| schema.is_none() || table.schema.as_deref() == schema)
            .filter(|table| types.iter().any(|t| t.eq_ignore_ascii_case(&table.table_type)))
            .map(|table| TableDescriptor {
                schema: table.schema.clone(),
                name: table.name.clone(),
                table_type: table.table_type.clone(),
            })
            .collect())
    }

    fn columns(&self, schema: Option<&str>, table: &str) -> DbResult<Vec<ColumnDescriptor>> {
        let state = self.db.state.lock()?;
        let found = state.tables.iter().find(|candidate| {
            candidate.name == table && (schema.is_none() || candidate.schema.as_deref() == schema)
        });
        Ok(found
            .map(|table| {
                table
                    .columns
                    .iter()
                    .map(|column| ColumnDescriptor {
                        name: column.name.clone(),
                        sql_type: column.sql_type,
                        nullable: column.nullable,
                        auto_increment: column.auto_increment,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn supports_generated_keys(&self) -> bool {
        true
    }
}
