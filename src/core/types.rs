use std::collections::HashMap;
use std::fmt;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref DEFAULT_SQL_TYPE_MAPPING: SqlTypeMapping = SqlTypeMapping::new();
}

/// Runtime type descriptor of a [`Value`](super::Value).
///
/// This is the key the coercion registry dispatches on. `Option<T>` and `T`
/// entity fields share a descriptor; nullability is tracked on the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValueType {
    Bool,
    Short,
    Int,
    Long,
    Float,
    Double,
    /// Exact decimal, for NUMERIC and DECIMAL columns.
    Decimal,
    Text,
    Date,
    Time,
    Timestamp,
    Instant,
    Uuid,
    Bytes,
    Array,
    /// Accepts any value unchanged.
    Any,
}

impl ValueType {
    pub fn is_integer(&self) -> bool {
        matches!(self, Self::Short | Self::Int | Self::Long)
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer() || matches!(self, Self::Float | Self::Double | Self::Decimal)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "BOOL",
            Self::Short => "SHORT",
            Self::Int => "INT",
            Self::Long => "LONG",
            Self::Float => "FLOAT",
            Self::Double => "DOUBLE",
            Self::Decimal => "DECIMAL",
            Self::Text => "TEXT",
            Self::Date => "DATE",
            Self::Time => "TIME",
            Self::Timestamp => "TIMESTAMP",
            Self::Instant => "INSTANT",
            Self::Uuid => "UUID",
            Self::Bytes => "BYTES",
            Self::Array => "ARRAY",
            Self::Any => "ANY",
        };
        write!(f, "{}", name)
    }
}

/// SQL type codes as reported by database metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlType {
    Bit,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Float,
    Real,
    Double,
    Numeric,
    Decimal,
    Char,
    Varchar,
    LongVarchar,
    Date,
    Time,
    Timestamp,
    Binary,
    VarBinary,
    LongVarBinary,
    Null,
    Other,
    Array,
    Blob,
    Clob,
    Boolean,
    NChar,
    NVarchar,
    LongNVarchar,
    NClob,
    TimeWithTimezone,
    TimestampWithTimezone,
}

impl SqlType {
    const ALL: [SqlType; 31] = [
        Self::Bit,
        Self::TinyInt,
        Self::SmallInt,
        Self::Integer,
        Self::BigInt,
        Self::Float,
        Self::Real,
        Self::Double,
        Self::Numeric,
        Self::Decimal,
        Self::Char,
        Self::Varchar,
        Self::LongVarchar,
        Self::Date,
        Self::Time,
        Self::Timestamp,
        Self::Binary,
        Self::VarBinary,
        Self::LongVarBinary,
        Self::Null,
        Self::Other,
        Self::Array,
        Self::Blob,
        Self::Clob,
        Self::Boolean,
        Self::NChar,
        Self::NVarchar,
        Self::LongNVarchar,
        Self::NClob,
        Self::TimeWithTimezone,
        Self::TimestampWithTimezone,
    ];

    /// Numeric type code, compatible with the JDBC `java.sql.Types` values.
    pub fn code(&self) -> i32 {
        match self {
            Self::Bit => -7,
            Self::TinyInt => -6,
            Self::SmallInt => 5,
            Self::Integer => 4,
            Self::BigInt => -5,
            Self::Float => 6,
            Self::Real => 7,
            Self::Double => 8,
            Self::Numeric => 2,
            Self::Decimal => 3,
            Self::Char => 1,
            Self::Varchar => 12,
            Self::LongVarchar => -1,
            Self::Date => 91,
            Self::Time => 92,
            Self::Timestamp => 93,
            Self::Binary => -2,
            Self::VarBinary => -3,
            Self::LongVarBinary => -4,
            Self::Null => 0,
            Self::Other => 1111,
            Self::Array => 2003,
            Self::Blob => 2004,
            Self::Clob => 2005,
            Self::Boolean => 16,
            Self::NChar => -15,
            Self::NVarchar => -9,
            Self::LongNVarchar => -16,
            Self::NClob => 2011,
            Self::TimeWithTimezone => 2013,
            Self::TimestampWithTimezone => 2014,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.code() == code)
    }

    /// Best guess at a column type for an untyped parameter value.
    pub fn for_value(value: &super::Value) -> Self {
        use super::Value;
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Boolean,
            Value::Short(_) => Self::SmallInt,
            Value::Int(_) => Self::Integer,
            Value::Long(_) => Self::BigInt,
            Value::Float(_) => Self::Real,
            Value::Double(_) => Self::Double,
            Value::Decimal(_) => Self::Numeric,
            Value::Text(_) => Self::Varchar,
            Value::Date(_) => Self::Date,
            Value::Time(_) => Self::Time,
            Value::Timestamp(_) => Self::Timestamp,
            Value::Instant(_) => Self::TimestampWithTimezone,
            Value::Uuid(_) => Self::Other,
            Value::Bytes(_) => Self::VarBinary,
            Value::Array(_) => Self::Array,
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Maps a column's SQL type to the value type bound for it.
#[derive(Debug, Clone)]
pub struct SqlTypeMapping {
    types: HashMap<SqlType, ValueType>,
}

impl SqlTypeMapping {
    pub fn new() -> Self {
        let mut types = HashMap::new();

        types.insert(SqlType::Boolean, ValueType::Bool);
        types.insert(SqlType::Bit, ValueType::Bool);
        types.insert(SqlType::TinyInt, ValueType::Short);
        types.insert(SqlType::SmallInt, ValueType::Short);
        types.insert(SqlType::Integer, ValueType::Int);
        types.insert(SqlType::BigInt, ValueType::Long);
        types.insert(SqlType::Float, ValueType::Float);
        types.insert(SqlType::Real, ValueType::Double);
        types.insert(SqlType::Double, ValueType::Double);
        types.insert(SqlType::Decimal, ValueType::Decimal);
        types.insert(SqlType::Numeric, ValueType::Decimal);

        for text in [
            SqlType::Char,
            SqlType::Varchar,
            SqlType::LongVarchar,
            SqlType::NChar,
            SqlType::NVarchar,
            SqlType::LongNVarchar,
            SqlType::Clob,
            SqlType::NClob,
        ] {
            types.insert(text, ValueType::Text);
        }

        for binary in [SqlType::Binary, SqlType::VarBinary, SqlType::LongVarBinary] {
            types.insert(binary, ValueType::Bytes);
        }

        types.insert(SqlType::Date, ValueType::Date);
        types.insert(SqlType::Time, ValueType::Time);
        types.insert(SqlType::TimeWithTimezone, ValueType::Time);
        types.insert(SqlType::Timestamp, ValueType::Timestamp);
        types.insert(SqlType::TimestampWithTimezone, ValueType::Instant);

        types.insert(SqlType::Blob, ValueType::Any);
        types.insert(SqlType::Null, ValueType::Any);
        types.insert(SqlType::Other, ValueType::Any);
        types.insert(SqlType::Array, ValueType::Array);

        Self { types }
    }

    /// The shared default mapping.
    pub fn global() -> &'static SqlTypeMapping {
        &DEFAULT_SQL_TYPE_MAPPING
    }

    pub fn value_type(&self, sql_type: SqlType) -> ValueType {
        self.types.get(&sql_type).copied().unwrap_or(ValueType::Any)
    }

    pub fn set(&mut self, sql_type: SqlType, value_type: ValueType) {
        self.types.insert(sql_type, value_type);
    }
}

impl Default for SqlTypeMapping {
    fn default() -> Self {
        Self::new()
    }
}

/// Name and type of one result or table column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub sql_type: SqlType,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
        }
    }
}
