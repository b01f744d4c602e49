use super::TypeCoercer;
use crate::core::{CoercionError, Value, ValueType};

/// Used for source types with no registered handler.
///
/// Values pass through unchanged unless text is requested; the field
/// receiving the value rejects it if it cannot hold it.
pub struct FallbackCoercer;

impl TypeCoercer for FallbackCoercer {
    fn name(&self) -> &'static str {
        "FallbackCoercer"
    }

    fn convert(&self, value: Value, target: ValueType) -> Result<Value, CoercionError> {
        match target {
            ValueType::Text => Ok(Value::Text(value.to_string())),
            _ => Ok(value),
        }
    }
}
