//! Per-connection prepared statement cache.
//!
//! A [`StatementCache`] belongs to one worker. It keeps one
//! [`PerConnectionCache`](entry::PerConnectionCache) per physical connection,
//! each holding two LRU maps keyed by SQL text: one for prepared statements
//! and one for procedure calls. After every insertion the map evicts at most
//! one entry, first by size and otherwise by age.
//!
//! Statements handed out are [`CachedStatement`]s whose `close()` is a no-op;
//! only eviction and clearing close the real statement.

pub mod clock;
mod entry;
pub mod key;
pub mod listener;
pub mod wrapped;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use tracing::trace;

use crate::core::{Error, Result};
use crate::driver::{Connection, PrepareOptions};

pub use clock::{Clock, ManualClock, SystemClock};
pub use key::ConnectionKey;
pub use listener::{CacheEvent, EvictReason, StatementCacheListener, StatementKind, TracingListener};
pub use wrapped::{CachedResultSet, CachedStatement};

use entry::{CloseFailures, Eviction, PerConnectionCache};

lazy_static! {
    static ref INSERT_SQL: Regex = Regex::new(r"(?i)^\s*insert\b").unwrap();
}

/// Whether `sql` is an INSERT, ignoring case and leading whitespace.
pub fn is_insert(sql: &str) -> bool {
    INSERT_SQL.is_match(sql)
}

/// Limits applied to every per-connection map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_age: Duration,
    /// Keep the caches of connections that are no longer the active one
    /// instead of clearing them when another connection shows up.
    pub retain_inactive_connections: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_age: Duration::from_secs(30 * 60),
            retain_inactive_connections: false,
        }
    }
}

/// Snapshot of cache occupancy.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub owner: String,
    pub connections: usize,
    pub connections_with_statements: usize,
    pub total_statements: usize,
    pub total_calls: usize,
    pub max_statements_per_connection: usize,
    pub mean_statements_per_connection: f64,
}

pub struct StatementCache {
    owner: Arc<str>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    listeners: Vec<Arc<dyn StatementCacheListener>>,
    connections: Option<HashMap<ConnectionKey, PerConnectionCache>>,
    active: Option<ConnectionKey>,
}

impl StatementCache {
    pub fn new(owner: impl Into<String>) -> Self {
        Self::with_config(owner, CacheConfig::default())
    }

    pub fn with_config(owner: impl Into<String>, config: CacheConfig) -> Self {
        Self {
            owner: Arc::from(owner.into()),
            config,
            clock: Arc::new(SystemClock),
            listeners: Vec::new(),
            connections: None,
            active: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    pub fn set_max_entries(&mut self, max_entries: usize) {
        self.config.max_entries = max_entries;
        self.emit(CacheEvent::MaxEntriesChanged {
            owner: self.owner.clone(),
            max_entries,
        });
    }

    pub fn set_max_age(&mut self, max_age: Duration) {
        self.config.max_age = max_age;
        self.emit(CacheEvent::MaxAgeChanged {
            owner: self.owner.clone(),
            max_age,
        });
    }

    pub fn add_listener(&mut self, listener: Arc<dyn StatementCacheListener>) {
        self.listeners.push(listener);
    }

    /// Remove a listener previously added. Returns whether it was found.
    pub fn remove_listener(&mut self, listener: &Arc<dyn StatementCacheListener>) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|existing| !Arc::ptr_eq(existing, listener));
        self.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// A cached prepared statement for `sql` on `conn`.
    ///
    /// INSERTs are prepared with generated key retrieval when
    /// `supports_generated_keys` is set.
    pub fn prepare_statement(
        &mut self,
        conn: &mut dyn Connection,
        sql: &str,
        supports_generated_keys: bool,
    ) -> Result<CachedStatement> {
        self.lookup(conn, sql, StatementKind::Prepared, supports_generated_keys)
    }

    /// A cached procedure call for `sql` on `conn`.
    pub fn prepare_call(&mut self, conn: &mut dyn Connection, sql: &str) -> Result<CachedStatement> {
        self.lookup(conn, sql, StatementKind::Call, false)
    }

    fn lookup(
        &mut self,
        conn: &mut dyn Connection,
        sql: &str,
        kind: StatementKind,
        supports_generated_keys: bool,
    ) -> Result<CachedStatement> {
        let key = ConnectionKey::derive(Some(&*conn))?;
        self.activate(key, sql);

        let reused = self.map_for(key)?.map_mut(kind).reuse(sql);
        if let Some((statement, access_count)) = reused {
            self.emit(CacheEvent::Reused {
                owner: self.owner.clone(),
                key,
                kind,
                sql: sql.to_string(),
                access_count,
            });
            return Ok(statement);
        }

        let raw = match kind {
            StatementKind::Prepared => {
                let options = PrepareOptions {
                    return_generated_keys: supports_generated_keys && is_insert(sql),
                };
                conn.prepare(sql, options)?
            }
            StatementKind::Call => conn.prepare_call(sql)?,
        };
        let statement = CachedStatement::new(raw);

        let now = self.clock.now_millis();
        let CacheConfig {
            max_entries, max_age, ..
        } = self.config;
        let eviction = self
            .map_for(key)?
            .map_mut(kind)
            .insert(sql, statement.clone(), now, max_entries, max_age);

        if let Some(eviction) = eviction {
            self.evict(key, kind, eviction);
        }
        self.emit(CacheEvent::Prepared {
            owner: self.owner.clone(),
            key,
            kind,
            sql: sql.to_string(),
        });

        Ok(statement)
    }

    /// Make `key` the active connection, creating caches as needed.
    fn activate(&mut self, key: ConnectionKey, sql: &str) {
        if self.connections.is_none() {
            self.connections = Some(HashMap::new());
            self.emit(CacheEvent::ThreadCacheCreated {
                owner: self.owner.clone(),
            });
        }

        if self.active != Some(key) && !self.config.retain_inactive_connections {
            let stale: Vec<ConnectionKey> = self
                .connections
                .iter()
                .flat_map(|connections| connections.keys().copied())
                .filter(|existing| *existing != key)
                .collect();
            for stale_key in stale {
                if let Some(mut cache) = self.connections.as_mut().and_then(|c| c.remove(&stale_key)) {
                    let (closed, failures) = cache.clear();
                    self.report_close_failures(stale_key, failures);
                    self.emit(CacheEvent::ConnectionCacheCleared {
                        owner: self.owner.clone(),
                        key: stale_key,
                        closed,
                    });
                }
            }
        }
        self.active = Some(key);

        let created = match self.connections.as_mut() {
            Some(connections) if !connections.contains_key(&key) => {
                connections.insert(key, PerConnectionCache::new(key));
                true
            }
            _ => false,
        };
        if created {
            self.emit(CacheEvent::ConnectionCacheCreated {
                owner: self.owner.clone(),
                key,
                sql: sql.to_string(),
            });
        }
    }

    fn map_for(&mut self, key: ConnectionKey) -> Result<&mut PerConnectionCache> {
        self.connections
            .as_mut()
            .and_then(|connections| connections.get_mut(&key))
            .ok_or_else(|| Error::ConnectionState(format!("no statement cache for {}", key)))
    }

    fn evict(&mut self, key: ConnectionKey, kind: StatementKind, eviction: Eviction) {
        let Eviction { sql, entry, reason } = eviction;
        trace!(owner = %self.owner, %key, sql = sql.as_str(), ?reason, "Evicting statement");

        if let Err(err) = entry.statement.close_wrapped() {
            self.emit(CacheEvent::EvictionCloseFailed {
                owner: self.owner.clone(),
                key,
                kind,
                sql,
                error: err.to_string(),
            });
            return;
        }

        self.emit(CacheEvent::Evicted {
            owner: self.owner.clone(),
            key,
            kind,
            sql,
            reason,
            created_millis: entry.created_millis,
            access_count: entry.access_count,
        });
    }

    fn report_close_failures(&self, key: ConnectionKey, failures: CloseFailures) {
        for (kind, sql, err) in failures {
            self.emit(CacheEvent::EvictionCloseFailed {
                owner: self.owner.clone(),
                key,
                kind,
                sql,
                error: err.to_string(),
            });
        }
    }

    /// Really close every cached statement and drop all per-connection
    /// caches. Listeners stay registered.
    ///
    /// Returns whether any statement was closed. Every entry is removed even
    /// when a close fails; the first failure is returned afterwards.
    pub fn clear(&mut self) -> Result<bool> {
        let Some(connections) = self.connections.take() else {
            return Ok(false);
        };
        self.active = None;

        let mut closed_any = false;
        let mut first_failure = None;
        for mut cache in connections.into_values() {
            let key = cache.key();
            let (closed, failures) = cache.clear();
            closed_any |= closed > 0;
            if first_failure.is_none() {
                first_failure = failures.first().map(|(_, _, err)| err.clone());
            }
            self.report_close_failures(key, failures);
            self.emit(CacheEvent::ConnectionCacheCleared {
                owner: self.owner.clone(),
                key,
                closed,
            });
        }

        self.emit(CacheEvent::ThreadCacheCleared {
            owner: self.owner.clone(),
        });

        match first_failure {
            Some(err) => Err(err.into()),
            None => Ok(closed_any),
        }
    }

    /// Really close and drop the statements cached for `conn`.
    pub fn clear_connection(&mut self, conn: &dyn Connection) -> Result<bool> {
        let key = ConnectionKey::derive(Some(conn))?;
        self.clear_key(key)
    }

    pub(crate) fn clear_key(&mut self, key: ConnectionKey) -> Result<bool> {
        let Some(mut cache) = self.connections.as_mut().and_then(|c| c.remove(&key)) else {
            return Ok(false);
        };
        if self.active == Some(key) {
            self.active = None;
        }

        let (closed, failures) = cache.clear();
        let first_failure = failures.first().map(|(_, _, err)| err.clone());
        self.report_close_failures(key, failures);
        self.emit(CacheEvent::ConnectionCacheCleared {
            owner: self.owner.clone(),
            key,
            closed,
        });

        match first_failure {
            Some(err) => Err(err.into()),
            None => Ok(closed > 0),
        }
    }

    /// Whether the cache has been initialized and not cleared since.
    pub fn is_active(&self) -> bool {
        self.connections.is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.as_ref().map_or(0, HashMap::len)
    }

    pub fn statement_count(&self, conn: &dyn Connection) -> usize {
        self.count_for(conn, StatementKind::Prepared)
    }

    pub fn call_count(&self, conn: &dyn Connection) -> usize {
        self.count_for(conn, StatementKind::Call)
    }

    fn count_for(&self, conn: &dyn Connection, kind: StatementKind) -> usize {
        self.cache_for(conn).map_or(0, |cache| cache.map(kind).len())
    }

    /// Access count of the prepared statement cached for `sql` on `conn`.
    pub fn access_count(&self, conn: &dyn Connection, sql: &str) -> Option<u64> {
        self.cache_for(conn)?.map(StatementKind::Prepared).access_count(sql)
    }

    fn cache_for(&self, conn: &dyn Connection) -> Option<&PerConnectionCache> {
        let key = ConnectionKey::derive(Some(conn)).ok()?;
        self.connections.as_ref()?.get(&key)
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            owner: self.owner.to_string(),
            ..CacheStats::default()
        };

        for cache in self.connections.iter().flat_map(HashMap::values) {
            let statements = cache.map(StatementKind::Prepared).len();
            stats.connections += 1;
            stats.total_statements += statements;
            stats.total_calls += cache.map(StatementKind::Call).len();
            stats.max_statements_per_connection = stats.max_statements_per_connection.max(statements);
            if statements > 0 {
                stats.connections_with_statements += 1;
            }
        }

        if stats.connections_with_statements > 0 {
            stats.mean_statements_per_connection =
                stats.total_statements as f64 / stats.connections_with_statements as f64;
        }
        stats
    }

    /// Prepared statements cached for `conn` as CSV
    /// (`access_count,created,sql`). Empty when nothing is cached.
    pub fn diagnostic_csv(&self, conn: &dyn Connection) -> String {
        self.cache_for(conn).map(|cache| cache.csv()).unwrap_or_default()
    }

    fn emit(&self, event: CacheEvent) {
        for listener in &self.listeners {
            listener.on_event(&event);
        }
    }

    /// Key of the connection most recently used.
    pub fn active_key(&self) -> Option<ConnectionKey> {
        self.active
    }
}

impl std::fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCache")
            .field("owner", &self.owner)
            .field("config", &self.config)
            .field("connections", &self.connection_count())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::core::SqlType;
    use crate::driver::Statement;
    use crate::driver::memory::{MemoryColumn, MemoryDatabase};

    fn database() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.create_table(
            "dept",
            vec![
                MemoryColumn::new("id", SqlType::BigInt).auto_increment(),
                MemoryColumn::new("name", SqlType::Varchar),
            ],
        )
        .unwrap();
        db
    }

    fn recorder(cache: &mut StatementCache) -> Arc<Mutex<Vec<CacheEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        cache.add_listener(Arc::new(move |event: &CacheEvent| {
            sink.lock().unwrap().push(event.clone());
        }));
        events
    }

    #[test]
    fn test_is_insert() {
        assert!(is_insert("  INSERT into t(a) values(?)"));
        assert!(!is_insert("select * from inserts"));
        assert!(!is_insert("inserted"));
    }

    #[test]
    fn test_first_prepare_creates_caches() {
        let db = database();
        let mut conn = db.connect();
        let mut cache = StatementCache::new("worker-1");
        let events = recorder(&mut cache);

        cache.prepare_statement(&mut conn, "select * from dept", true).unwrap();

        let events = events.lock().unwrap();
        assert!(matches!(events[0], CacheEvent::ThreadCacheCreated { .. }));
        assert!(matches!(events[1], CacheEvent::ConnectionCacheCreated { .. }));
        assert!(matches!(events[2], CacheEvent::Prepared { .. }));
        assert_eq!(cache.statement_count(&conn), 1);
    }

    #[test]
    fn test_insert_prepared_with_generated_keys() {
        let db = database();
        let mut conn = db.connect();
        let mut cache = StatementCache::new("worker-1");

        let mut insert = cache
            .prepare_statement(&mut conn, "insert into dept(name) values(?)", true)
            .unwrap();
        insert.bind(1, &"Ops".into(), SqlType::Varchar).unwrap();
        insert.execute_update().unwrap();
        let mut keys = insert.generated_keys().unwrap();
        assert!(keys.next().unwrap());

        let mut plain = cache
            .prepare_statement(&mut conn, "insert into dept(name) values(?),(?)", false)
            .unwrap();
        plain.bind(1, &"a".into(), SqlType::Varchar).unwrap();
        plain.bind(2, &"b".into(), SqlType::Varchar).unwrap();
        plain.execute_update().unwrap();
        assert!(!plain.generated_keys().unwrap().next().unwrap());
    }

    #[test]
    fn test_calls_are_cached_separately() {
        let db = database();
        db.register_procedure("noop", |_| Ok(0)).unwrap();
        let mut conn = db.connect();
        let mut cache = StatementCache::new("worker-1");

        let mut call = cache.prepare_call(&mut conn, "call noop()").unwrap();
        call.execute_update().unwrap();
        let again = cache.prepare_call(&mut conn, "call noop()").unwrap();
        assert!(call.same_statement(&again));
        assert_eq!(cache.call_count(&conn), 1);
        assert_eq!(cache.statement_count(&conn), 0);
    }

    #[test]
    fn test_connection_change_clears_old_cache() {
        let db = database();
        let mut first = db.connect();
        let mut second = db.connect();
        let mut cache = StatementCache::new("worker-1");
        let events = recorder(&mut cache);

        let old = cache.prepare_statement(&mut first, "select * from dept", true).unwrap();
        cache.prepare_statement(&mut second, "select * from dept", true).unwrap();

        assert!(old.is_closed());
        assert_eq!(cache.connection_count(), 1);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, CacheEvent::ConnectionCacheCleared { closed: 1, .. })));
    }

    #[test]
    fn test_retained_connections() {
        let db = database();
        let mut first = db.connect();
        let mut second = db.connect();
        let config = CacheConfig {
            retain_inactive_connections: true,
            ..CacheConfig::default()
        };
        let mut cache = StatementCache::with_config("worker-1", config);

        let old = cache.prepare_statement(&mut first, "select * from dept", true).unwrap();
        cache.prepare_statement(&mut second, "select * from dept", true).unwrap();
        assert!(!old.is_closed());
        assert_eq!(cache.connection_count(), 2);

        let stats = cache.stats();
        assert_eq!(stats.connections_with_statements, 2);
        assert_eq!(stats.total_statements, 2);
        assert_eq!(stats.mean_statements_per_connection, 1.0);
    }

    #[test]
    fn test_clear_closes_and_resets() {
        let db = database();
        let mut conn = db.connect();
        let mut cache = StatementCache::new("worker-1");
        let events = recorder(&mut cache);

        let stmt = cache.prepare_statement(&mut conn, "select * from dept", true).unwrap();
        assert!(cache.clear().unwrap());
        assert!(stmt.is_closed());
        assert!(!cache.is_active());
        assert_eq!(cache.listener_count(), 1);
        assert!(!cache.clear().unwrap());

        assert!(matches!(
            events.lock().unwrap().last(),
            Some(CacheEvent::ThreadCacheCleared { .. })
        ));
    }

    #[test]
    fn test_limit_changes_emit_events() {
        let mut cache = StatementCache::new("worker-1");
        let events = recorder(&mut cache);
        cache.set_max_entries(5);
        cache.set_max_age(Duration::from_secs(1));
        assert_eq!(cache.config().max_entries, 5);

        let events = events.lock().unwrap();
        assert!(matches!(events[0], CacheEvent::MaxEntriesChanged { max_entries: 5, .. }));
        assert!(matches!(events[1], CacheEvent::MaxAgeChanged { .. }));
    }

    #[test]
    fn test_remove_listener() {
        let mut cache = StatementCache::new("worker-1");
        let listener: Arc<dyn StatementCacheListener> = Arc::new(TracingListener);
        cache.add_listener(Arc::clone(&listener));
        assert!(cache.remove_listener(&listener));
        assert!(!cache.remove_listener(&listener));
    }

    #[test]
    fn test_diagnostic_csv() {
        let db = database();
        let mut conn = db.connect();
        let clock = Arc::new(ManualClock::new(0));
        let mut cache = StatementCache::new("worker-1").with_clock(clock);

        cache.prepare_statement(&mut conn, "select * from dept", true).unwrap();
        cache.prepare_statement(&mut conn, "select * from dept", true).unwrap();

        let csv = cache.diagnostic_csv(&conn);
        assert_eq!(csv, "access_count,created,sql\n2,1970-01-01 00:00:00,select * from dept\n");
    }
}
