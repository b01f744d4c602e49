use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use uuid::Uuid;

use super::TypeCoercer;
use crate::core::{CoercionError, Value, ValueType};

const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M"];
const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"];

/// Parses text into every scalar type.
pub struct TextCoercer;

impl TextCoercer {
    fn parse_failed(&self, target: ValueType, err: impl ToString) -> CoercionError {
        CoercionError::new(self.name(), ValueType::Text, target).with_detail(err.to_string())
    }

    fn parse_time(&self, s: &str) -> Result<NaiveTime, CoercionError> {
        TIME_FORMATS
            .iter()
            .find_map(|format| NaiveTime::parse_from_str(s, format).ok())
            .ok_or_else(|| self.parse_failed(ValueType::Time, format!("'{}' is not a time", s)))
    }

    fn parse_timestamp(&self, s: &str, target: ValueType) -> Result<NaiveDateTime, CoercionError> {
        TIMESTAMP_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
            .ok_or_else(|| self.parse_failed(target, format!("'{}' is not a timestamp", s)))
    }
}

impl TypeCoercer for TextCoercer {
    fn name(&self) -> &'static str {
        "StringCoercer"
    }

    fn convert(&self, value: Value, target: ValueType) -> Result<Value, CoercionError> {
        let s = match &value {
            Value::Text(s) => s.trim(),
            _ => return Err(self.unsupported(&value, target)),
        };

        let converted = match target {
            // Anything other than "true" reads as false
            ValueType::Bool => Value::Bool(s.eq_ignore_ascii_case("true")),
            ValueType::Short => Value::Short(s.parse().map_err(|e| self.parse_failed(target, e))?),
            ValueType::Int => Value::Int(s.parse().map_err(|e| self.parse_failed(target, e))?),
            ValueType::Long => Value::Long(s.parse().map_err(|e| self.parse_failed(target, e))?),
            ValueType::Float => Value::Float(s.parse().map_err(|e| self.parse_failed(target, e))?),
            ValueType::Double => Value::Double(s.parse().map_err(|e| self.parse_failed(target, e))?),
            ValueType::Decimal => Value::Decimal(BigDecimal::from_str(s).map_err(|e| self.parse_failed(target, e))?),
            ValueType::Date => Value::Date(
                NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| self.parse_failed(target, e))?,
            ),
            ValueType::Time => Value::Time(self.parse_time(s)?),
            ValueType::Timestamp => Value::Timestamp(self.parse_timestamp(s, target)?),
            ValueType::Instant => match DateTime::parse_from_rfc3339(s) {
                Ok(instant) => Value::Instant(instant.with_timezone(&Utc)),
                // Zone-less text is read as UTC
                Err(_) => Value::Instant(self.parse_timestamp(s, target)?.and_utc()),
            },
            ValueType::Uuid => Value::Uuid(Uuid::parse_str(s).map_err(|e| self.parse_failed(target, e))?),
            ValueType::Any => value,
            _ => return Err(self.unsupported(&value, target)),
        };

        Ok(converted)
    }
}

pub struct UuidCoercer;

impl TypeCoercer for UuidCoercer {
    fn name(&self) -> &'static str {
        "UUIDCoercer"
    }

    fn convert(&self, value: Value, target: ValueType) -> Result<Value, CoercionError> {
        match (value, target) {
            (Value::Uuid(uuid), ValueType::Text) => Ok(Value::Text(uuid.to_string())),
            (value, ValueType::Any) => Ok(value),
            (value, target) => Err(self.unsupported(&value, target)),
        }
    }
}
