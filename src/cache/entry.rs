use std::time::Duration;

use chrono::DateTime;
use lru::LruCache;

use super::key::ConnectionKey;
use super::listener::{EvictReason, StatementKind};
use super::wrapped::CachedStatement;
use crate::core::DbError;
use crate::driver::Statement;

pub(crate) struct CacheEntry {
    pub(crate) statement: CachedStatement,
    pub(crate) created_millis: i64,
    pub(crate) access_count: u64,
}

pub(crate) struct Eviction {
    pub(crate) sql: String,
    pub(crate) entry: CacheEntry,
    pub(crate) reason: EvictReason,
}

/// One LRU map of statements keyed by SQL text.
pub(crate) struct StatementMap {
    entries: LruCache<String, CacheEntry>,
}

impl StatementMap {
    fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
        }
    }

    /// A hit promotes the entry and bumps its access count. An entry whose
    /// statement was closed underneath is dropped and reported as a miss.
    pub(crate) fn reuse(&mut self, sql: &str) -> Option<(CachedStatement, u64)> {
        let entry = self.entries.get_mut(sql)?;
        if entry.statement.is_closed() {
            self.entries.pop(sql);
            return None;
        }
        entry.access_count += 1;
        Some((entry.statement.clone(), entry.access_count))
    }

    /// Insert `statement` and apply at most one eviction.
    pub(crate) fn insert(
        &mut self,
        sql: &str,
        statement: CachedStatement,
        now_millis: i64,
        max_entries: usize,
        max_age: Duration,
    ) -> Option<Eviction> {
        self.entries.put(
            sql.to_string(),
            CacheEntry {
                statement,
                created_millis: now_millis,
                access_count: 1,
            },
        );

        let reason = if self.entries.len() > max_entries {
            EvictReason::MaxEntries
        } else {
            let (_, oldest) = self.entries.peek_lru()?;
            let age = now_millis.saturating_sub(oldest.created_millis);
            if age <= max_age.as_millis() as i64 {
                return None;
            }
            EvictReason::MaxAge
        };

        let (sql, entry) = self.entries.pop_lru()?;
        Some(Eviction { sql, entry, reason })
    }

    pub(crate) fn access_count(&self, sql: &str) -> Option<u64> {
        self.entries.peek(sql).map(|entry| entry.access_count)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Really close every statement and empty the map.
    fn drain(&mut self) -> (usize, Vec<(String, DbError)>) {
        let mut closed = 0;
        let mut failures = Vec::new();
        while let Some((sql, entry)) = self.entries.pop_lru() {
            if entry.statement.is_closed() {
                continue;
            }
            match entry.statement.close_wrapped() {
                Ok(()) => closed += 1,
                Err(err) => failures.push((sql, err)),
            }
        }
        (closed, failures)
    }

    /// `access_count,created,sql` rows, most recently used first.
    fn csv_rows(&self, out: &mut String) {
        for (sql, entry) in self.entries.iter() {
            let created = DateTime::from_timestamp_millis(entry.created_millis)
                .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();
            out.push_str(&format!("{},{},{}\n", entry.access_count, created, csv_field(sql)));
        }
    }
}

fn csv_field(text: &str) -> String {
    if text.contains([',', '"', '\n']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

/// Close failures collected while clearing, as `(kind, sql, error)`.
pub(crate) type CloseFailures = Vec<(StatementKind, String, DbError)>;

/// Statements and procedure calls cached for one connection.
pub(crate) struct PerConnectionCache {
    key: ConnectionKey,
    statements: StatementMap,
    calls: StatementMap,
}

impl PerConnectionCache {
    pub(crate) fn new(key: ConnectionKey) -> Self {
        Self {
            key,
            statements: StatementMap::new(),
            calls: StatementMap::new(),
        }
    }

    pub(crate) fn key(&self) -> ConnectionKey {
        self.key
    }

    pub(crate) fn map(&self, kind: StatementKind) -> &StatementMap {
        match kind {
            StatementKind::Prepared => &self.statements,
            StatementKind::Call => &self.calls,
        }
    }

    pub(crate) fn map_mut(&mut self, kind: StatementKind) -> &mut StatementMap {
        match kind {
            StatementKind::Prepared => &mut self.statements,
            StatementKind::Call => &mut self.calls,
        }
    }

    /// Close everything. Returns how many statements were closed and which
    /// closes failed; failed entries are removed all the same.
    pub(crate) fn clear(&mut self) -> (usize, CloseFailures) {
        let mut failures = Vec::new();
        let mut closed = 0;
        for kind in [StatementKind::Prepared, StatementKind::Call] {
            let (count, failed) = self.map_mut(kind).drain();
            closed += count;
            failures.extend(failed.into_iter().map(|(sql, err)| (kind, sql, err)));
        }
        (closed, failures)
    }

    pub(crate) fn csv(&self) -> String {
        let mut out = String::from("access_count,created,sql\n");
        self.statements.csv_rows(&mut out);
        out
    }
}
