pub mod config;
pub mod transaction;

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::cache::{CachedStatement, ConnectionKey, StatementCache};
use crate::coerce::Coercer;
use crate::core::{DbResult, Error, Result, SqlType, Value};
use crate::driver::{Connection, DatabaseMetadata, PrepareOptions, ResultSet, Statement};
use config::OrmConfig;

/// A session shared by every [`Home`](crate::Home) of one worker.
pub type SharedSession = Arc<Mutex<Session>>;

/// Supplies one live connection and the statement cache bound to it.
///
/// A session belongs to a single worker. Share it between homes through
/// [`SharedSession`], not between threads doing independent work.
pub struct Session {
    connection: Option<Box<dyn Connection>>,
    cache: Option<StatementCache>,
    config: OrmConfig,
    coercer: Arc<Coercer>,
    generation: u64,
}

impl Session {
    /// A session without a connection, labelled `owner` in cache events.
    pub fn new(owner: impl Into<String>, config: OrmConfig) -> Result<Self> {
        config.validate()?;
        let cache = config
            .cache_enabled
            .then(|| StatementCache::with_config(owner, config.cache_config()));

        Ok(Self {
            connection: None,
            cache,
            config,
            coercer: Arc::new(Coercer::new()),
            generation: 0,
        })
    }

    pub fn with_connection(mut self, connection: impl Connection + 'static) -> Self {
        self.connection = Some(Box::new(connection));
        self.generation += 1;
        self
    }

    pub fn with_coercer(mut self, coercer: Arc<Coercer>) -> Self {
        self.coercer = coercer;
        self
    }

    pub fn into_shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &OrmConfig {
        &self.config
    }

    pub fn coercer(&self) -> &Arc<Coercer> {
        &self.coercer
    }

    pub fn cache(&self) -> Option<&StatementCache> {
        self.cache.as_ref()
    }

    pub fn cache_mut(&mut self) -> Option<&mut StatementCache> {
        self.cache.as_mut()
    }

    /// Bumped every time the connection is replaced. Table bindings compare
    /// it to decide whether their column metadata is stale.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub fn connection(&self) -> Result<&dyn Connection> {
        match self.connection.as_deref() {
            Some(connection) => Ok(connection),
            None => Err(Error::ConnectionState("no connection is bound".into())),
        }
    }

    pub fn connection_mut(&mut self) -> Result<&mut dyn Connection> {
        live(&mut self.connection)
    }

    /// Replace the connection, returning the previous one.
    ///
    /// Statements cached for the previous connection are really closed; the
    /// previous connection itself is left open for the caller to dispose of.
    pub fn set_connection(
        &mut self,
        connection: Box<dyn Connection>,
    ) -> Option<Box<dyn Connection>> {
        let previous = self.connection.replace(connection);
        self.generation += 1;

        // A new wrapper over the same physical connection keeps its statements
        let same_physical = match (
            ConnectionKey::derive(previous.as_deref()),
            ConnectionKey::derive(self.connection.as_deref()),
        ) {
            (Ok(old), Ok(new)) => old == new,
            _ => false,
        };

        if let (Some(cache), Some(old)) = (self.cache.as_mut(), previous.as_deref()) {
            if !old.is_closed() && !same_physical {
                if let Err(err) = cache.clear_connection(old) {
                    warn!(error = %err, "Failed to release statements of replaced connection");
                }
            }
        }
        debug!(generation = self.generation, "Session connection replaced");
        previous
    }

    pub fn metadata(&self) -> Result<Box<dyn DatabaseMetadata + '_>> {
        Ok(self.connection()?.metadata()?)
    }

    /// Whether INSERTs should ask for generated keys: both the
    /// configuration and the driver have to allow it.
    pub fn supports_generated_keys(&self) -> Result<bool> {
        if !self.config.supports_generated_keys {
            return Ok(false);
        }
        Ok(self.metadata()?.supports_generated_keys())
    }

    /// A statement for `sql`, served from the cache when caching is on.
    pub fn prepare(&mut self, sql: &str) -> Result<StatementHandle> {
        let generated_keys = self.supports_generated_keys()?;
        let connection = live(&mut self.connection)?;

        match self.cache.as_mut() {
            Some(cache) => Ok(StatementHandle::Cached(cache.prepare_statement(
                connection,
                sql,
                generated_keys,
            )?)),
            None => {
                let options = PrepareOptions {
                    return_generated_keys: generated_keys && crate::cache::is_insert(sql),
                };
                Ok(StatementHandle::Owned(connection.prepare(sql, options)?))
            }
        }
    }

    /// A procedure call for `sql`, served from the cache when caching is on.
    pub fn prepare_call(&mut self, sql: &str) -> Result<StatementHandle> {
        let connection = live(&mut self.connection)?;
        match self.cache.as_mut() {
            Some(cache) => Ok(StatementHandle::Cached(cache.prepare_call(connection, sql)?)),
            None => Ok(StatementHandle::Owned(connection.prepare_call(sql)?)),
        }
    }

    /// Release the cached statements of the current connection and close it.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut connection) = self.connection.take() else {
            return Ok(());
        };
        self.generation += 1;

        let released = match self.cache.as_mut() {
            Some(cache) if !connection.is_closed() => {
                cache.clear_connection(&*connection).map(|_| ())
            }
            _ => Ok(()),
        };
        connection.close()?;
        released
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            if let Err(err) = cache.clear() {
                warn!(error = %err, "Failed to release cached statements on session drop");
            }
        }
    }
}

fn live(connection: &mut Option<Box<dyn Connection>>) -> Result<&mut dyn Connection> {
    match connection.as_deref_mut() {
        Some(connection) if !connection.is_closed() => Ok(connection),
        Some(_) => Err(Error::ConnectionState("connection is closed".into())),
        None => Err(Error::ConnectionState("no connection is bound".into())),
    }
}

/// A statement handed out by [`Session::prepare`].
///
/// `Cached` statements stay open when closed or dropped. `Owned` statements
/// are closed when the handle is dropped.
pub enum StatementHandle {
    Cached(CachedStatement),
    Owned(Box<dyn Statement>),
}

impl StatementHandle {
    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }

    fn inner(&self) -> &dyn Statement {
        match self {
            Self::Cached(statement) => statement,
            Self::Owned(statement) => &**statement,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Statement {
        match self {
            Self::Cached(statement) => statement,
            Self::Owned(statement) => &mut **statement,
        }
    }
}

impl Statement for StatementHandle {
    fn sql(&self) -> &str {
        self.inner().sql()
    }

    fn bind(&mut self, index: usize, value: &Value, sql_type: SqlType) -> DbResult<()> {
        self.inner_mut().bind(index, value, sql_type)
    }

    fn bind_null(&mut self, index: usize, sql_type: SqlType) -> DbResult<()> {
        self.inner_mut().bind_null(index, sql_type)
    }

    fn bind_array(&mut self, index: usize, element_type: &str, elements: &[Value]) -> DbResult<()> {
        self.inner_mut().bind_array(index, element_type, elements)
    }

    fn clear_parameters(&mut self) -> DbResult<()> {
        self.inner_mut().clear_parameters()
    }

    fn execute_update(&mut self) -> DbResult<u64> {
        self.inner_mut().execute_update()
    }

    fn execute_query(&mut self) -> DbResult<Box<dyn ResultSet>> {
        self.inner_mut().execute_query()
    }

    fn generated_keys(&mut self) -> DbResult<Box<dyn ResultSet>> {
        self.inner_mut().generated_keys()
    }

    fn is_closed(&self) -> bool {
        self.inner().is_closed()
    }

    fn close(&mut self) -> DbResult<()> {
        self.inner_mut().close()
    }
}

impl Drop for StatementHandle {
    fn drop(&mut self) {
        if let Self::Owned(statement) = self {
            if !statement.is_closed() {
                if let Err(err) = statement.close() {
                    warn!(sql = statement.sql(), error = %err, "Failed to close statement");
                }
            }
        }
    }
}
