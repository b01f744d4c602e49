// ============================================================================
// beanmap Library
// ============================================================================

//! Entity mapping over relational connections.
//!
//! - [`entity`]: declarative field metadata, built once per entity type
//! - [`coerce`]: value conversion between row and field types
//! - [`mapping`]: result rows to entities
//! - [`cache`]: per-connection prepared statement cache with LRU and age
//!   eviction
//! - [`table`] and [`home`]: INSERT/UPDATE/DELETE generation and the
//!   per-entity gateway
//! - [`driver`]: the connection traits, plus an in-memory implementation

extern crate self as beanmap;

pub mod cache;
pub mod coerce;
pub mod connection;
pub mod core;
pub mod driver;
pub mod entity;
pub mod home;
pub mod mapping;
pub mod table;

// Re-export main types for convenience
pub use cache::{CacheConfig, CacheEvent, CacheStats, StatementCache, StatementCacheListener};
pub use coerce::Coercer;
pub use connection::{
    Session, SharedSession, StatementHandle, config::OrmConfig, transaction::Transaction,
};
pub use core::{CoercionError, DbError, Error, Result, SqlType, Value, ValueType};
pub use entity::{Entity, EntityBuilder, EntityMetadata, EntityRegistry, FieldValue};
pub use home::{Home, HomeGroup};
pub use mapping::{EntityCursor, RowMapper};
pub use table::{ColumnInfo, Table};

pub use beanmap_derive::Entity;
pub use bigdecimal::BigDecimal;
