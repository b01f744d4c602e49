use thiserror::Error;

use super::types::ValueType;

/// Failures reported by a database driver.
///
/// These are passed through to callers untouched, wrapped in
/// [`Error::Database`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DbError {
    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Statement is closed: {0}")]
    StatementClosed(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Lock error: {0}")]
    Lock(String),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

/// A single value could not be converted to the requested type.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("The {coercer} does not know how to convert {source_type} to type [{target}]{}", detail_suffix(.detail))]
pub struct CoercionError {
    pub coercer: &'static str,
    pub source_type: ValueType,
    pub target: ValueType,
    pub detail: Option<String>,
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(detail) => format!(": {}", detail),
        None => String::new(),
    }
}

impl CoercionError {
    pub fn new(coercer: &'static str, source_type: ValueType, target: ValueType) -> Self {
        Self {
            coercer,
            source_type,
            target,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Mapping error: {message}")]
    Mapping {
        message: String,
        #[source]
        source: Option<Box<Error>>,
    },

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Connection state error: {0}")]
    ConnectionState(String),

    #[error(transparent)]
    Coercion(#[from] CoercionError),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error("Lock error: {0}")]
    Lock(String),
}

impl Error {
    pub fn mapping(message: impl Into<String>) -> Self {
        Self::Mapping {
            message: message.into(),
            source: None,
        }
    }

    /// Wraps `source` with the entity/column context it was raised in.
    pub fn mapping_caused_by(message: impl Into<String>, source: impl Into<Error>) -> Self {
        Self::Mapping {
            message: message.into(),
            source: Some(Box::new(source.into())),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_coercion_error_names_handler_and_target() {
        let err = CoercionError::new("IntegerCoercer", ValueType::Int, ValueType::Uuid);
        let text = err.to_string();
        assert!(text.contains("IntegerCoercer"));
        assert!(text.contains("UUID"));
        assert!(text.contains("INT"));
    }

    #[test]
    fn test_mapping_error_keeps_source() {
        let cause = CoercionError::new("TextCoercer", ValueType::Text, ValueType::Int)
            .with_detail("invalid digit found in string");
        let err = Error::mapping_caused_by("Failed to coerce dept.id", cause);

        assert_eq!(err.to_string(), "Mapping error: Failed to coerce dept.id");
        let source = err.source().unwrap().to_string();
        assert!(source.contains("invalid digit"));
    }
}
