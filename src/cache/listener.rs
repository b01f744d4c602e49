use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace, warn};

use super::key::ConnectionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatementKind {
    Prepared,
    Call,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prepared => write!(f, "prepared"),
            Self::Call => write!(f, "call"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EvictReason {
    MaxEntries,
    MaxAge,
}

/// Something that happened inside a [`StatementCache`](super::StatementCache).
///
/// `owner` is the label of the cache that emitted the event.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    ThreadCacheCreated {
        owner: Arc<str>,
    },
    ConnectionCacheCreated {
        owner: Arc<str>,
        key: ConnectionKey,
        sql: String,
    },
    Prepared {
        owner: Arc<str>,
        key: ConnectionKey,
        kind: StatementKind,
        sql: String,
    },
    Reused {
        owner: Arc<str>,
        key: ConnectionKey,
        kind: StatementKind,
        sql: String,
        access_count: u64,
    },
    Evicted {
        owner: Arc<str>,
        key: ConnectionKey,
        kind: StatementKind,
        sql: String,
        reason: EvictReason,
        created_millis: i64,
        access_count: u64,
    },
    ConnectionCacheCleared {
        owner: Arc<str>,
        key: ConnectionKey,
        closed: usize,
    },
    ThreadCacheCleared {
        owner: Arc<str>,
    },
    EvictionCloseFailed {
        owner: Arc<str>,
        key: ConnectionKey,
        kind: StatementKind,
        sql: String,
        error: String,
    },
    MaxEntriesChanged {
        owner: Arc<str>,
        max_entries: usize,
    },
    MaxAgeChanged {
        owner: Arc<str>,
        max_age: Duration,
    },
}

/// Observes cache activity. Called synchronously, in registration order.
pub trait StatementCacheListener: Send + Sync {
    fn on_event(&self, event: &CacheEvent);
}

impl<F> StatementCacheListener for F
where
    F: Fn(&CacheEvent) + Send + Sync,
{
    fn on_event(&self, event: &CacheEvent) {
        self(event)
    }
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl StatementCacheListener for TracingListener {
    fn on_event(&self, event: &CacheEvent) {
        match event {
            CacheEvent::ThreadCacheCreated { owner } => debug!(%owner, "Statement cache created"),
            CacheEvent::ConnectionCacheCreated { owner, key, sql } => {
                debug!(%owner, %key, sql = sql.as_str(), "Connection cache created")
            }
            CacheEvent::Prepared { owner, key, kind, sql } => {
                trace!(%owner, %key, %kind, sql = sql.as_str(), "Statement prepared")
            }
            CacheEvent::Reused {
                owner,
                key,
                kind,
                sql,
                access_count,
            } => trace!(%owner, %key, %kind, sql = sql.as_str(), access_count, "Statement reused"),
            CacheEvent::Evicted {
                owner,
                key,
                kind,
                sql,
                reason,
                access_count,
                ..
            } => debug!(
                %owner,
                %key,
                %kind,
                sql = sql.as_str(),
                ?reason,
                access_count,
                "Statement evicted"
            ),
            CacheEvent::ConnectionCacheCleared { owner, key, closed } => {
                debug!(%owner, %key, closed, "Connection cache cleared")
            }
            CacheEvent::ThreadCacheCleared { owner } => debug!(%owner, "Statement cache cleared"),
            CacheEvent::EvictionCloseFailed {
                owner,
                key,
                kind,
                sql,
                error,
            } => warn!(%owner, %key, %kind, sql = sql.as_str(), error = error.as_str(), "Failed to close evicted statement"),
            CacheEvent::MaxEntriesChanged { owner, max_entries } => {
                debug!(%owner, max_entries, "Statement cache max entries changed")
            }
            CacheEvent::MaxAgeChanged { owner, max_age } => {
                debug!(%owner, ?max_age, "Statement cache max age changed")
            }
        }
    }
}
