pub mod error;
pub mod types;
pub mod value;

pub use error::{CoercionError, DbError, DbResult, Error, Result};
pub use types::{ColumnMeta, SqlType, SqlTypeMapping, ValueType};
pub use value::Value;
