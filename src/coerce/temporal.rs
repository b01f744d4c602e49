use chrono::{NaiveTime, Timelike};

use super::TypeCoercer;
use crate::core::{CoercionError, Value, ValueType};

pub struct DateCoercer;

impl TypeCoercer for DateCoercer {
    fn name(&self) -> &'static str {
        "DateCoercer"
    }

    fn convert(&self, value: Value, target: ValueType) -> Result<Value, CoercionError> {
        let Value::Date(date) = value else {
            return Err(self.unsupported(&value, target));
        };
        let midnight = date.and_time(NaiveTime::MIN);

        match target {
            ValueType::Timestamp => Ok(Value::Timestamp(midnight)),
            ValueType::Instant => Ok(Value::Instant(midnight.and_utc())),
            ValueType::Long => Ok(Value::Long(midnight.and_utc().timestamp_millis())),
            ValueType::Text => Ok(Value::Text(value.to_string())),
            ValueType::Any => Ok(value),
            _ => Err(self.unsupported(&value, target)),
        }
    }
}

pub struct TimeCoercer;

impl TypeCoercer for TimeCoercer {
    fn name(&self) -> &'static str {
        "TimeCoercer"
    }

    fn convert(&self, value: Value, target: ValueType) -> Result<Value, CoercionError> {
        let Value::Time(time) = value else {
            return Err(self.unsupported(&value, target));
        };

        match target {
            ValueType::Long => {
                let millis = time.num_seconds_from_midnight() as i64 * 1_000
                    + (time.nanosecond() / 1_000_000) as i64;
                Ok(Value::Long(millis))
            }
            ValueType::Text => Ok(Value::Text(value.to_string())),
            ValueType::Any => Ok(value),
            _ => Err(self.unsupported(&value, target)),
        }
    }
}

pub struct TimestampCoercer;

impl TypeCoercer for TimestampCoercer {
    fn name(&self) -> &'static str {
        "TimestampCoercer"
    }

    fn convert(&self, value: Value, target: ValueType) -> Result<Value, CoercionError> {
        let Value::Timestamp(ts) = value else {
            return Err(self.unsupported(&value, target));
        };

        match target {
            ValueType::Date => Ok(Value::Date(ts.date())),
            ValueType::Time => Ok(Value::Time(ts.time())),
            ValueType::Instant => Ok(Value::Instant(ts.and_utc())),
            ValueType::Long => Ok(Value::Long(ts.and_utc().timestamp_millis())),
            ValueType::Text => Ok(Value::Text(value.to_string())),
            ValueType::Any => Ok(value),
            _ => Err(self.unsupported(&value, target)),
        }
    }
}

pub struct InstantCoercer;

impl TypeCoercer for InstantCoercer {
    fn name(&self) -> &'static str {
        "InstantCoercer"
    }

    fn convert(&self, value: Value, target: ValueType) -> Result<Value, CoercionError> {
        let Value::Instant(instant) = value else {
            return Err(self.unsupported(&value, target));
        };

        match target {
            ValueType::Timestamp => Ok(Value::Timestamp(instant.naive_utc())),
            ValueType::Date => Ok(Value::Date(instant.date_naive())),
            ValueType::Long => Ok(Value::Long(instant.timestamp_millis())),
            ValueType::Text => Ok(Value::Text(value.to_string())),
            ValueType::Any => Ok(value),
            _ => Err(self.unsupported(&value, target)),
        }
    }
}
