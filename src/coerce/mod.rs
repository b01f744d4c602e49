//! Value coercion.
//!
//! A [`Coercer`] converts a [`Value`] to a requested [`ValueType`]. Dispatch
//! is an exact match on the value's runtime type: every source type has at
//! most one [`TypeCoercer`], and values whose type has none go to the
//! fallback handler.

mod fallback;
mod numeric;
mod temporal;
mod text;

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{CoercionError, Value, ValueType};

pub use fallback::FallbackCoercer;
pub use numeric::{DecimalCoercer, FloatCoercer, IntegerCoercer};
pub use temporal::{DateCoercer, InstantCoercer, TimeCoercer, TimestampCoercer};
pub use text::{TextCoercer, UuidCoercer};

/// Converts values of one source type.
pub trait TypeCoercer: Send + Sync {
    /// Handler name used in error messages.
    fn name(&self) -> &'static str;

    /// Convert `value` to `target`. `value` is never NULL and never already
    /// of type `target`.
    fn convert(&self, value: Value, target: ValueType) -> Result<Value, CoercionError>;

    fn unsupported(&self, value: &Value, target: ValueType) -> CoercionError {
        CoercionError::new(
            self.name(),
            value.value_type().unwrap_or(ValueType::Any),
            target,
        )
    }
}

/// Registry of [`TypeCoercer`]s keyed by source type.
#[derive(Clone)]
pub struct Coercer {
    handlers: HashMap<ValueType, Arc<dyn TypeCoercer>>,
    fallback: Arc<dyn TypeCoercer>,
}

impl Coercer {
    /// A registry with no handlers; every conversion goes to the fallback.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(FallbackCoercer),
        }
    }

    pub fn new() -> Self {
        let mut coercer = Self::empty();

        coercer.register(ValueType::Text, Arc::new(TextCoercer));
        coercer.register(ValueType::Short, Arc::new(IntegerCoercer::new(ValueType::Short)));
        coercer.register(ValueType::Int, Arc::new(IntegerCoercer::new(ValueType::Int)));
        coercer.register(ValueType::Long, Arc::new(IntegerCoercer::new(ValueType::Long)));
        coercer.register(ValueType::Float, Arc::new(FloatCoercer::new(ValueType::Float)));
        coercer.register(ValueType::Double, Arc::new(FloatCoercer::new(ValueType::Double)));
        coercer.register(ValueType::Decimal, Arc::new(DecimalCoercer));
        coercer.register(ValueType::Date, Arc::new(DateCoercer));
        coercer.register(ValueType::Time, Arc::new(TimeCoercer));
        coercer.register(ValueType::Timestamp, Arc::new(TimestampCoercer));
        coercer.register(ValueType::Instant, Arc::new(InstantCoercer));
        coercer.register(ValueType::Uuid, Arc::new(UuidCoercer));

        coercer
    }

    /// Register or replace the handler for values of type `source`.
    pub fn register(&mut self, source: ValueType, handler: Arc<dyn TypeCoercer>) {
        self.handlers.insert(source, handler);
    }

    pub fn set_fallback(&mut self, handler: Arc<dyn TypeCoercer>) {
        self.fallback = handler;
    }

    pub fn handler(&self, source: ValueType) -> Option<&dyn TypeCoercer> {
        self.handlers.get(&source).map(|handler| &**handler)
    }

    pub fn convert(&self, value: Value, target: ValueType) -> Result<Value, CoercionError> {
        let Some(source) = value.value_type() else {
            return Ok(Value::Null);
        };

        if source == target {
            return Ok(value);
        }

        match self.handlers.get(&source) {
            Some(handler) => handler.convert(value, target),
            None => self.fallback.convert(value, target),
        }
    }
}

impl Default for Coercer {
    fn default() -> Self {
        Self::new()
    }
}
