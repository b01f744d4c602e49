use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bigdecimal::ToPrimitive;

use super::MemoryDatabase;
use super::sql::Command;
use crate::core::{ColumnMeta, DbError, DbResult, SqlType, Value};
use crate::driver::{ResultSet, Statement};

struct StatementState {
    params: Vec<Option<Value>>,
    generated: Option<MemoryResultSet>,
    closed: bool,
}

/// A statement prepared on a memory connection.
///
/// Clones share state, so a result set can hand back its statement.
#[derive(Clone)]
pub struct MemoryStatement {
    db: MemoryDatabase,
    sql: Arc<str>,
    command: Arc<Command>,
    return_keys: bool,
    connection_closed: Arc<AtomicBool>,
    state: Arc<Mutex<StatementState>>,
}

impl MemoryStatement {
    pub(crate) fn new(
        db: MemoryDatabase,
        sql: &str,
        command: Command,
        return_keys: bool,
        connection_closed: Arc<AtomicBool>,
    ) -> Self {
        let params = vec![None; command.param_count()];
        Self {
            db,
            sql: Arc::from(sql),
            command: Arc::new(command),
            return_keys,
            connection_closed,
            state: Arc::new(Mutex::new(StatementState {
                params,
                generated: None,
                closed: false,
            })),
        }
    }

    fn set_param(&mut self, index: usize, value: Value) -> DbResult<()> {
        let mut state = self.open_state()?;
        let count = state.params.len();
        match index.checked_sub(1).and_then(|i| state.params.get_mut(i)) {
            Some(slot) => {
                *slot = Some(value);
                Ok(())
            }
            None => Err(DbError::Execution(format!(
                "parameter index {} is out of range 1..={}",
                index, count
            ))),
        }
    }

    fn open_state(&self) -> DbResult<std::sync::MutexGuard<'_, StatementState>> {
        if self.connection_closed.load(Ordering::Acquire) {
            return Err(DbError::ConnectionClosed);
        }
        let state = self.state.lock()?;
        if state.closed {
            return Err(DbError::StatementClosed(self.sql.to_string()));
        }
        Ok(state)
    }

    fn bound_params(state: &StatementState) -> DbResult<Vec<Value>> {
        state
            .params
            .iter()
            .enumerate()
            .map(|(i, param)| {
                param
                    .clone()
                    .ok_or_else(|| DbError::Execution(format!("parameter {} is not bound", i + 1)))
            })
            .collect()
    }
}

impl Statement for MemoryStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    fn bind(&mut self, index: usize, value: &Value, _sql_type: SqlType) -> DbResult<()> {
        self.set_param(index, value.clone())
    }

    fn bind_null(&mut self, index: usize, _sql_type: SqlType) -> DbResult<()> {
        self.set_param(index, Value::Null)
    }

    fn bind_array(&mut self, index: usize, _element_type: &str, elements: &[Value]) -> DbResult<()> {
        self.set_param(index, Value::Array(elements.to_vec()))
    }

    fn clear_parameters(&mut self) -> DbResult<()> {
        let mut state = self.open_state()?;
        state.params.iter_mut().for_each(|param| *param = None);
        Ok(())
    }

    fn execute_update(&mut self) -> DbResult<u64> {
        if self.command.returns_rows() {
            return Err(DbError::Execution(format!("'{}' returns rows", self.sql)));
        }

        let mut state = self.open_state()?;
        let params = Self::bound_params(&state)?;
        self.db.record_execution();

        match &*self.command {
            Command::Insert { table, columns, rows } => {
                let (meta, inserted) = self.db.insert(table, columns, *rows, &params)?;
                let count = inserted.len() as u64;
                state.generated = self
                    .return_keys
                    .then(|| MemoryResultSet::new(meta, inserted, None));
                Ok(count)
            }
            Command::Update {
                table,
                assignments,
                conditions,
            } => {
                let (values, filter) = params.split_at(assignments.len());
                self.db.update(table, assignments, conditions, values, filter)
            }
            Command::Delete { table, conditions } => self.db.delete(table, conditions, &params),
            Command::Call { procedure, .. } => self.db.call(procedure, &params),
            Command::Select { .. } => Err(DbError::Execution(format!("'{}' returns rows", self.sql))),
        }
    }

    fn execute_query(&mut self) -> DbResult<Box<dyn ResultSet>> {
        let Command::Select {
            table,
            conditions,
            order_by,
        } = &*self.command
        else {
            return Err(DbError::Execution(format!("'{}' does not return rows", self.sql)));
        };

        let params = {
            let state = self.open_state()?;
            Self::bound_params(&state)?
        };
        self.db.record_execution();

        let (columns, rows) = self.db.select(table, conditions, &params, order_by.as_deref())?;
        Ok(Box::new(MemoryResultSet::new(columns, rows, Some(self.clone()))))
    }

    fn generated_keys(&mut self) -> DbResult<Box<dyn ResultSet>> {
        let mut state = self.open_state()?;
        let keys = state
            .generated
            .take()
            .unwrap_or_else(|| MemoryResultSet::new(Vec::new(), Vec::new(), None));
        Ok(Box::new(keys.owned_by(self.clone())))
    }

    fn is_closed(&self) -> bool {
        self.connection_closed.load(Ordering::Acquire)
            || self.state.lock().map(|state| state.closed).unwrap_or(true)
    }

    fn close(&mut self) -> DbResult<()> {
        {
            let mut state = self.state.lock()?;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.generated = None;
        }
        self.db.record_close(&self.sql)
    }
}

/// Rows materialized by a memory statement.
pub struct MemoryResultSet {
    columns: Vec<ColumnMeta>,
    rows: Vec<Vec<Value>>,
    position: Option<usize>,
    closed: bool,
    owner: Option<MemoryStatement>,
}

impl MemoryResultSet {
    pub(crate) fn new(columns: Vec<ColumnMeta>, rows: Vec<Vec<Value>>, owner: Option<MemoryStatement>) -> Self {
        Self {
            columns,
            rows,
            position: None,
            closed: false,
            owner,
        }
    }

    fn owned_by(mut self, owner: MemoryStatement) -> Self {
        self.owner = Some(owner);
        self
    }

    fn current(&self) -> DbResult<&Vec<Value>> {
        if self.closed {
            return Err(DbError::Execution("result set is closed".into()));
        }
        self.position
            .and_then(|pos| self.rows.get(pos))
            .ok_or_else(|| DbError::Execution("result set has no current row".into()))
    }
}

impl ResultSet for MemoryResultSet {
    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    fn next(&mut self) -> DbResult<bool> {
        if self.closed {
            return Err(DbError::Execution("result set is closed".into()));
        }
        let next = self.position.map_or(0, |pos| pos + 1);
        self.position = Some(next.min(self.rows.len()));
        Ok(next < self.rows.len())
    }

    fn get(&self, index: usize) -> DbResult<Value> {
        self.current()?
            .get(index)
            .cloned()
            .ok_or_else(|| DbError::Execution(format!("column index {} is out of range", index)))
    }

    fn statement(&self) -> Option<Box<dyn Statement>> {
        self.owner
            .as_ref()
            .map(|owner| Box::new(owner.clone()) as Box<dyn Statement>)
    }

    fn close(&mut self) -> DbResult<()> {
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Ordering used by `order by`: NULLs first, numbers numerically, everything
/// else by its text form.
pub(crate) fn compare_values(a: &Value, b: &Value) -> CmpOrdering {
    match (a, b) {
        (Value::Null, Value::Null) => CmpOrdering::Equal,
        (Value::Null, _) => CmpOrdering::Less,
        (_, Value::Null) => CmpOrdering::Greater,
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Float(f) => Some(*f as f64),
        Value::Double(d) => Some(*d),
        Value::Decimal(d) => d.to_f64(),
        other => other.as_i64().map(|i| i as f64),
    }
}
