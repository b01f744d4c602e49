//! Database client abstraction.
//!
//! The mapping layer only talks to a database through these traits. The
//! [`memory`] module provides an in-process implementation.

pub mod memory;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::{ColumnMeta, DbResult, SqlType, Value};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Identity of one physical database connection.
///
/// Drivers mint a token when the physical connection is opened. Wrappers
/// handed out by a pool report the token of the connection they wrap, so
/// two checkouts of the same physical connection share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionToken(u64);

impl ConnectionToken {
    pub fn mint() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrepareOptions {
    /// Make keys generated by an INSERT available through
    /// [`Statement::generated_keys`].
    pub return_generated_keys: bool,
}

impl PrepareOptions {
    pub fn generated_keys() -> Self {
        Self {
            return_generated_keys: true,
        }
    }
}

/// Savepoint handle returned by [`Connection::set_savepoint`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Savepoint {
    pub id: u64,
    pub name: Option<String>,
}

pub trait Connection: Send {
    /// Token of the underlying physical connection, if it has one.
    fn physical_token(&self) -> Option<ConnectionToken>;

    fn is_closed(&self) -> bool;

    fn is_valid(&self) -> bool {
        !self.is_closed()
    }

    fn prepare(&mut self, sql: &str, options: PrepareOptions) -> DbResult<Box<dyn Statement>>;

    fn prepare_call(&mut self, sql: &str) -> DbResult<Box<dyn Statement>>;

    fn metadata(&self) -> DbResult<Box<dyn DatabaseMetadata + '_>>;

    fn auto_commit(&self) -> bool;

    fn set_auto_commit(&mut self, auto_commit: bool) -> DbResult<()>;

    fn commit(&mut self) -> DbResult<()>;

    fn rollback(&mut self) -> DbResult<()>;

    fn set_savepoint(&mut self, name: Option<&str>) -> DbResult<Savepoint>;

    fn rollback_to_savepoint(&mut self, savepoint: &Savepoint) -> DbResult<()>;

    fn release_savepoint(&mut self, savepoint: &Savepoint) -> DbResult<()>;

    fn close(&mut self) -> DbResult<()>;
}

pub trait Statement: Send {
    fn sql(&self) -> &str;

    /// Bind `value` to the 1-based parameter `index` as a column of `sql_type`.
    fn bind(&mut self, index: usize, value: &Value, sql_type: SqlType) -> DbResult<()>;

    fn bind_null(&mut self, index: usize, sql_type: SqlType) -> DbResult<()>;

    /// Bind an array of `element_type` values (a database type name such as
    /// `"varchar"` or `"bigint"`).
    fn bind_array(&mut self, index: usize, element_type: &str, elements: &[Value]) -> DbResult<()>;

    fn clear_parameters(&mut self) -> DbResult<()>;

    /// Run an INSERT, UPDATE, DELETE or CALL. Returns the affected row count.
    fn execute_update(&mut self) -> DbResult<u64>;

    fn execute_query(&mut self) -> DbResult<Box<dyn ResultSet>>;

    /// Keys generated by the last `execute_update`. Empty unless the
    /// statement was prepared with [`PrepareOptions::return_generated_keys`].
    fn generated_keys(&mut self) -> DbResult<Box<dyn ResultSet>>;

    fn is_closed(&self) -> bool;

    fn close(&mut self) -> DbResult<()>;
}

/// A forward-only cursor over rows.
pub trait ResultSet: Send {
    fn columns(&self) -> &[ColumnMeta];

    /// Advance to the next row. Returns `false` once the rows are exhausted.
    fn next(&mut self) -> DbResult<bool>;

    /// Value of the 0-based column `index` in the current row.
    fn get(&self, index: usize) -> DbResult<Value>;

    /// Elements of an array column in the current row.
    fn get_array(&self, index: usize) -> DbResult<Option<Vec<Value>>> {
        match self.get(index)? {
            Value::Null => Ok(None),
            Value::Array(items) => Ok(Some(items)),
            other => Ok(Some(vec![other])),
        }
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns()
            .iter()
            .position(|column| column.name.eq_ignore_ascii_case(name))
    }

    /// The statement that produced this result, when the driver can hand
    /// one out.
    fn statement(&self) -> Option<Box<dyn Statement>> {
        None
    }

    fn close(&mut self) -> DbResult<()>;

    fn is_closed(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub schema: Option<String>,
    pub name: String,
    pub table_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub auto_increment: bool,
}

pub trait DatabaseMetadata {
    fn table_types(&self) -> DbResult<Vec<String>>;

    /// Tables in `schema` (exact match; `None` means any schema) whose type
    /// is one of `types`.
    fn tables(&self, schema: Option<&str>, types: &[String]) -> DbResult<Vec<TableDescriptor>>;

    fn columns(&self, schema: Option<&str>, table: &str) -> DbResult<Vec<ColumnDescriptor>>;

    fn supports_generated_keys(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique() {
        let a = ConnectionToken::mint();
        let b = ConnectionToken::mint();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
        assert!(a.to_string().starts_with("conn#"));
    }
}
