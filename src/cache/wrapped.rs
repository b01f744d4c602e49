use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::{ColumnMeta, DbResult, SqlType, Value};
use crate::driver::{ResultSet, Statement};

/// A cache-owned statement.
///
/// `close()` does nothing: the cache decides when the statement really
/// closes. Clones refer to the same underlying statement.
#[derive(Clone)]
pub struct CachedStatement {
    sql: Arc<str>,
    inner: Arc<Mutex<Box<dyn Statement>>>,
}

impl CachedStatement {
    pub(crate) fn new(statement: Box<dyn Statement>) -> Self {
        Self {
            sql: Arc::from(statement.sql()),
            inner: Arc::new(Mutex::new(statement)),
        }
    }

    fn lock(&self) -> DbResult<MutexGuard<'_, Box<dyn Statement>>> {
        Ok(self.inner.lock()?)
    }

    /// Close the underlying statement.
    pub(crate) fn close_wrapped(&self) -> DbResult<()> {
        let mut statement = self.lock()?;
        if statement.is_closed() {
            return Ok(());
        }
        statement.close()
    }

    /// Whether both handles wrap the same underlying statement.
    pub fn same_statement(&self, other: &CachedStatement) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Statement for CachedStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    fn bind(&mut self, index: usize, value: &Value, sql_type: SqlType) -> DbResult<()> {
        self.lock()?.bind(index, value, sql_type)
    }

    fn bind_null(&mut self, index: usize, sql_type: SqlType) -> DbResult<()> {
        self.lock()?.bind_null(index, sql_type)
    }

    fn bind_array(&mut self, index: usize, element_type: &str, elements: &[Value]) -> DbResult<()> {
        self.lock()?.bind_array(index, element_type, elements)
    }

    fn clear_parameters(&mut self) -> DbResult<()> {
        self.lock()?.clear_parameters()
    }

    fn execute_update(&mut self) -> DbResult<u64> {
        self.lock()?.execute_update()
    }

    fn execute_query(&mut self) -> DbResult<Box<dyn ResultSet>> {
        let rs = self.lock()?.execute_query()?;
        Ok(Box::new(CachedResultSet::new(rs, self.clone())))
    }

    fn generated_keys(&mut self) -> DbResult<Box<dyn ResultSet>> {
        let rs = self.lock()?.generated_keys()?;
        Ok(Box::new(CachedResultSet::new(rs, self.clone())))
    }

    fn is_closed(&self) -> bool {
        self.inner
            .lock()
            .map(|statement| statement.is_closed())
            .unwrap_or(true)
    }

    fn close(&mut self) -> DbResult<()> {
        Ok(())
    }
}

/// A result set whose `statement()` is the cached façade rather than the
/// raw statement behind it.
pub struct CachedResultSet {
    inner: Box<dyn ResultSet>,
    owner: CachedStatement,
}

impl CachedResultSet {
    fn new(inner: Box<dyn ResultSet>, owner: CachedStatement) -> Self {
        Self { inner, owner }
    }
}

impl ResultSet for CachedResultSet {
    fn columns(&self) -> &[ColumnMeta] {
        self.inner.columns()
    }

    fn next(&mut self) -> DbResult<bool> {
        self.inner.next()
    }

    fn get(&self, index: usize) -> DbResult<Value> {
        self.inner.get(index)
    }

    fn get_array(&self, index: usize) -> DbResult<Option<Vec<Value>>> {
        self.inner.get_array(index)
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.inner.column_index(name)
    }

    fn statement(&self) -> Option<Box<dyn Statement>> {
        Some(Box::new(self.owner.clone()))
    }

    fn close(&mut self) -> DbResult<()> {
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}
