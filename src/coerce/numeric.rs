use std::str::FromStr;

use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::DateTime;

use super::TypeCoercer;
use crate::core::{CoercionError, Value, ValueType};

/// 2^63. Casting a float at or above it back to `i64` saturates.
const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;

fn exact_f64(n: i64) -> Option<f64> {
    let f = n as f64;
    (f < TWO_POW_63 && f as i64 == n).then_some(f)
}

fn exact_f32(n: i64) -> Option<f32> {
    let f = n as f32;
    ((f as f64) < TWO_POW_63 && f as i64 == n).then_some(f)
}

/// Handles `Short`, `Int` and `Long` values.
pub struct IntegerCoercer {
    source: ValueType,
}

impl IntegerCoercer {
    pub fn new(source: ValueType) -> Self {
        debug_assert!(source.is_integer());
        Self { source }
    }

    fn out_of_range(&self, value: &Value, target: ValueType) -> CoercionError {
        self.unsupported(value, target)
            .with_detail(format!("{} is out of range", value))
    }

    fn inexact(&self, value: &Value, target: ValueType) -> CoercionError {
        self.unsupported(value, target)
            .with_detail(format!("{} has no exact {} representation", value, target))
    }
}

impl TypeCoercer for IntegerCoercer {
    fn name(&self) -> &'static str {
        match self.source {
            ValueType::Short => "ShortCoercer",
            ValueType::Int => "IntegerCoercer",
            _ => "LongCoercer",
        }
    }

    fn convert(&self, value: Value, target: ValueType) -> Result<Value, CoercionError> {
        let Some(n) = value.as_i64() else {
            return Err(self.unsupported(&value, target));
        };

        match target {
            ValueType::Short => i16::try_from(n)
                .map(Value::Short)
                .map_err(|_| self.out_of_range(&value, target)),
            ValueType::Int => i32::try_from(n)
                .map(Value::Int)
                .map_err(|_| self.out_of_range(&value, target)),
            ValueType::Long => Ok(Value::Long(n)),
            ValueType::Float => exact_f32(n)
                .map(Value::Float)
                .ok_or_else(|| self.inexact(&value, target)),
            ValueType::Double => exact_f64(n)
                .map(Value::Double)
                .ok_or_else(|| self.inexact(&value, target)),
            ValueType::Decimal => Ok(Value::Decimal(BigDecimal::from(n))),
            ValueType::Text => Ok(Value::Text(n.to_string())),
            // Epoch milliseconds
            ValueType::Instant if self.source == ValueType::Long => DateTime::from_timestamp_millis(n)
                .map(Value::Instant)
                .ok_or_else(|| self.out_of_range(&value, target)),
            ValueType::Timestamp if self.source == ValueType::Long => {
                DateTime::from_timestamp_millis(n)
                    .map(|instant| Value::Timestamp(instant.naive_utc()))
                    .ok_or_else(|| self.out_of_range(&value, target))
            }
            ValueType::Any => Ok(value),
            _ => Err(self.unsupported(&value, target)),
        }
    }
}

/// Handles `Float` and `Double` values.
pub struct FloatCoercer {
    source: ValueType,
}

impl FloatCoercer {
    pub fn new(source: ValueType) -> Self {
        debug_assert!(matches!(source, ValueType::Float | ValueType::Double));
        Self { source }
    }

    /// `n` as a signed integer of `bits` width, if it is one.
    fn integral(&self, value: &Value, n: f64, target: ValueType, bits: i32) -> Result<i64, CoercionError> {
        let limit = 2f64.powi(bits - 1);
        if n.fract() != 0.0 || !n.is_finite() || n < -limit || n >= limit {
            return Err(self
                .unsupported(value, target)
                .with_detail(format!("{} is not an integral value in range", n)));
        }
        Ok(n as i64)
    }
}

impl TypeCoercer for FloatCoercer {
    fn name(&self) -> &'static str {
        match self.source {
            ValueType::Float => "FloatCoercer",
            _ => "DoubleCoercer",
        }
    }

    fn convert(&self, value: Value, target: ValueType) -> Result<Value, CoercionError> {
        let n = match &value {
            Value::Float(f) => *f as f64,
            Value::Double(d) => *d,
            _ => return Err(self.unsupported(&value, target)),
        };

        match target {
            ValueType::Float => Ok(Value::Float(n as f32)),
            ValueType::Double => Ok(Value::Double(n)),
            ValueType::Text => Ok(Value::Text(value.to_string())),
            // Shortest decimal form, so 0.1 stays 0.1
            ValueType::Decimal if n.is_finite() => BigDecimal::from_str(&value.to_string())
                .map(Value::Decimal)
                .map_err(|err| self.unsupported(&value, target).with_detail(err.to_string())),
            ValueType::Short if self.source == ValueType::Double => self
                .integral(&value, n, target, 16)
                .map(|n| Value::Short(n as i16)),
            ValueType::Int if self.source == ValueType::Double => self
                .integral(&value, n, target, 32)
                .map(|n| Value::Int(n as i32)),
            ValueType::Long if self.source == ValueType::Double => self
                .integral(&value, n, target, 64)
                .map(Value::Long),
            ValueType::Any => Ok(value),
            _ => Err(self.unsupported(&value, target)),
        }
    }
}

/// Handles exact `Decimal` values.
///
/// Integer targets take only integral values that fit. Float targets get
/// the nearest representable value.
pub struct DecimalCoercer;

impl DecimalCoercer {
    fn not_integral(&self, value: &Value, target: ValueType) -> CoercionError {
        self.unsupported(value, target)
            .with_detail(format!("{} is not an integral value in range", value))
    }

    fn integral(&self, value: &Value, d: &BigDecimal, target: ValueType) -> Result<i64, CoercionError> {
        if !d.is_integer() {
            return Err(self.not_integral(value, target));
        }
        d.to_i64().ok_or_else(|| self.not_integral(value, target))
    }
}

impl TypeCoercer for DecimalCoercer {
    fn name(&self) -> &'static str {
        "BigDecimalCoercer"
    }

    fn convert(&self, value: Value, target: ValueType) -> Result<Value, CoercionError> {
        let Value::Decimal(d) = &value else {
            return Err(self.unsupported(&value, target));
        };

        match target {
            ValueType::Short => {
                let n = self.integral(&value, d, target)?;
                i16::try_from(n)
                    .map(Value::Short)
                    .map_err(|_| self.not_integral(&value, target))
            }
            ValueType::Int => {
                let n = self.integral(&value, d, target)?;
                i32::try_from(n)
                    .map(Value::Int)
                    .map_err(|_| self.not_integral(&value, target))
            }
            ValueType::Long => self.integral(&value, d, target).map(Value::Long),
            ValueType::Float => d
                .to_f32()
                .filter(|f| f.is_finite())
                .map(Value::Float)
                .ok_or_else(|| self.unsupported(&value, target)),
            ValueType::Double => d
                .to_f64()
                .filter(|f| f.is_finite())
                .map(Value::Double)
                .ok_or_else(|| self.unsupported(&value, target)),
            ValueType::Text => Ok(Value::Text(d.to_string())),
            ValueType::Any => Ok(value),
            _ => Err(self.unsupported(&value, target)),
        }
    }
}
