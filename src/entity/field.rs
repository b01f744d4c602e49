use std::fmt;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use uuid::Uuid;

use crate::core::{CoercionError, Value, ValueType};

const FIELD_ACCESSOR: &str = "FieldAccessor";

// ============================================================================
// FieldValue
// ============================================================================

/// A Rust type that can live in an entity field.
///
/// `from_value` receives a value that has already been coerced to
/// `VALUE_TYPE`, or NULL.
pub trait FieldValue: Sized + Send + 'static {
    const VALUE_TYPE: ValueType;
    const NULLABLE: bool = false;

    fn to_value(&self) -> Value;

    fn from_value(value: Value) -> Result<Self, CoercionError>;
}

fn mismatch(value: &Value, target: ValueType) -> CoercionError {
    match value.value_type() {
        Some(source) => CoercionError::new(FIELD_ACCESSOR, source, target),
        None => CoercionError::new(FIELD_ACCESSOR, ValueType::Any, target)
            .with_detail("NULL cannot be assigned to a non-optional field"),
    }
}

macro_rules! impl_field_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl FieldValue for $ty {
                const VALUE_TYPE: ValueType = ValueType::$variant;

                fn to_value(&self) -> Value {
                    Value::$variant(self.clone())
                }

                fn from_value(value: Value) -> Result<Self, CoercionError> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        other => Err(mismatch(&other, Self::VALUE_TYPE)),
                    }
                }
            }
        )*
    };
}

impl_field_value! {
    bool => Bool,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    BigDecimal => Decimal,
    String => Text,
    NaiveDate => Date,
    NaiveTime => Time,
    NaiveDateTime => Timestamp,
    DateTime<Utc> => Instant,
    Uuid => Uuid,
    Vec<u8> => Bytes,
}

macro_rules! impl_array_field_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FieldValue for Vec<$ty> {
                const VALUE_TYPE: ValueType = ValueType::Array;

                fn to_value(&self) -> Value {
                    Value::Array(self.iter().map(FieldValue::to_value).collect())
                }

                fn from_value(value: Value) -> Result<Self, CoercionError> {
                    match value {
                        Value::Array(items) => items
                            .into_iter()
                            .map(<$ty as FieldValue>::from_value)
                            .collect(),
                        other => Err(mismatch(&other, Self::VALUE_TYPE)),
                    }
                }
            }
        )*
    };
}

impl_array_field_value!(bool, i16, i32, i64, f64, String, Uuid);

impl<V: FieldValue> FieldValue for Option<V> {
    const VALUE_TYPE: ValueType = V::VALUE_TYPE;
    const NULLABLE: bool = true;

    fn to_value(&self) -> Value {
        match self {
            Some(v) => v.to_value(),
            None => Value::Null,
        }
    }

    fn from_value(value: Value) -> Result<Self, CoercionError> {
        match value {
            Value::Null => Ok(None),
            other => V::from_value(other).map(Some),
        }
    }
}

// ============================================================================
// FieldDef
// ============================================================================

pub(crate) type Getter<T> = Arc<dyn Fn(&T) -> Value + Send + Sync>;
pub(crate) type Setter<T> = Arc<dyn Fn(&mut T, Value) -> Result<(), CoercionError> + Send + Sync>;

/// How a field is reached on the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Direct projection to a struct field.
    Field,
    /// A getter/setter pair.
    Property,
}

/// Metadata and accessors for one mapped column of entity `T`.
pub struct FieldDef<T> {
    pub(crate) key: String,
    pub(crate) value_type: ValueType,
    pub(crate) nullable: bool,
    pub(crate) primary_key: bool,
    pub(crate) defaultable: bool,
    pub(crate) access: Access,
    pub(crate) getter: Getter<T>,
    pub(crate) setter: Setter<T>,
}

impl<T> FieldDef<T> {
    /// Lowercase column key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn is_primary_key(&self) -> bool {
        self.primary_key
    }

    /// NULL values of this field are left out of inserts so the database
    /// can fill them in.
    pub fn is_defaultable(&self) -> bool {
        self.defaultable
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn get(&self, entity: &T) -> Value {
        (self.getter)(entity)
    }

    /// Assign an already-coerced value.
    pub fn set(&self, entity: &mut T, value: Value) -> Result<(), CoercionError> {
        (self.setter)(entity, value)
    }
}

impl<T> Clone for FieldDef<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            value_type: self.value_type,
            nullable: self.nullable,
            primary_key: self.primary_key,
            defaultable: self.defaultable,
            access: self.access,
            getter: Arc::clone(&self.getter),
            setter: Arc::clone(&self.setter),
        }
    }
}

impl<T> fmt::Debug for FieldDef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDef")
            .field("key", &self.key)
            .field("value_type", &self.value_type)
            .field("nullable", &self.nullable)
            .field("primary_key", &self.primary_key)
            .field("defaultable", &self.defaultable)
            .field("access", &self.access)
            .finish()
    }
}
