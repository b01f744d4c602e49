// ============================================================================
// Coercion Property Tests
// ============================================================================

//! Property tests for the value coercer: NULL and identity pass through,
//! integer narrowing is range checked, and text parsing agrees with the
//! value's display form.

use beanmap::{BigDecimal, Coercer, Value, ValueType};
use proptest::prelude::*;

const TARGETS: [ValueType; 16] = [
    ValueType::Bool,
    ValueType::Short,
    ValueType::Int,
    ValueType::Long,
    ValueType::Float,
    ValueType::Double,
    ValueType::Decimal,
    ValueType::Text,
    ValueType::Date,
    ValueType::Time,
    ValueType::Timestamp,
    ValueType::Instant,
    ValueType::Uuid,
    ValueType::Bytes,
    ValueType::Array,
    ValueType::Any,
];

fn target() -> impl Strategy<Value = ValueType> {
    prop::sample::select(TARGETS.to_vec())
}

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        any::<i16>().prop_map(Value::Short),
        any::<i32>().prop_map(Value::Int),
        any::<i64>().prop_map(Value::Long),
        any::<f64>().prop_map(Value::Double),
        any::<i64>().prop_map(|n| Value::Decimal(BigDecimal::from(n))),
        ".{0,16}".prop_map(Value::Text),
        any::<u128>().prop_map(|n| Value::Uuid(uuid::Uuid::from_u128(n))),
        prop::collection::vec(any::<u8>(), 0..8).prop_map(Value::Bytes),
    ]
}

proptest! {
    #[test]
    fn null_converts_to_null(target in target()) {
        let coercer = Coercer::new();
        prop_assert_eq!(coercer.convert(Value::Null, target).unwrap(), Value::Null);
    }

    #[test]
    fn same_type_is_identity(value in scalar()) {
        let coercer = Coercer::new();
        let Some(source) = value.value_type() else {
            return Ok(());
        };
        prop_assert_eq!(coercer.convert(value.clone(), source).unwrap(), value);
    }

    #[test]
    fn any_target_keeps_value(value in scalar()) {
        let coercer = Coercer::new();
        prop_assert_eq!(coercer.convert(value.clone(), ValueType::Any).unwrap(), value);
    }

    #[test]
    fn conversion_never_panics(value in scalar(), target in target()) {
        let coercer = Coercer::new();
        let _ = coercer.convert(value, target);
    }

    #[test]
    fn long_to_short_is_range_checked(n in any::<i64>()) {
        let coercer = Coercer::new();
        let result = coercer.convert(Value::Long(n), ValueType::Short);
        match i16::try_from(n) {
            Ok(expected) => prop_assert_eq!(result.unwrap(), Value::Short(expected)),
            Err(_) => {
                let err = result.unwrap_err();
                prop_assert_eq!(err.coercer, "LongCoercer");
                prop_assert_eq!(err.target, ValueType::Short);
            }
        }
    }

    #[test]
    fn integer_widening_is_exact(n in any::<i32>()) {
        let coercer = Coercer::new();
        prop_assert_eq!(
            coercer.convert(Value::Int(n), ValueType::Long).unwrap(),
            Value::Long(n as i64)
        );
    }

    #[test]
    fn long_to_double_is_exact_or_rejected(n in any::<i64>()) {
        let coercer = Coercer::new();
        match coercer.convert(Value::Long(n), ValueType::Double) {
            Ok(Value::Double(d)) => prop_assert_eq!(d as i128, n as i128),
            Ok(other) => prop_assert!(false, "expected a double, got {:?}", other),
            Err(err) => prop_assert_eq!(err.coercer, "LongCoercer"),
        }
    }

    #[test]
    fn integers_through_decimal_are_exact(n in any::<i64>()) {
        let coercer = Coercer::new();
        let decimal = coercer.convert(Value::Long(n), ValueType::Decimal).unwrap();
        prop_assert_eq!(coercer.convert(decimal, ValueType::Long).unwrap(), Value::Long(n));
    }

    #[test]
    fn integer_text_parses_back(n in any::<i64>(), pad in "[ \t]{0,3}") {
        let coercer = Coercer::new();
        let text = coercer.convert(Value::Long(n), ValueType::Text).unwrap();
        let padded = format!("{}{}{}", pad, text, pad);
        prop_assert_eq!(
            coercer.convert(Value::Text(padded), ValueType::Long).unwrap(),
            Value::Long(n)
        );
    }

    #[test]
    fn fractional_double_rejects_integers(whole in -1_000_000i64..1_000_000, frac in 0.01f64..0.99) {
        let coercer = Coercer::new();
        let value = Value::Double(whole as f64 + frac);
        prop_assert!(coercer.convert(value, ValueType::Long).is_err());
        prop_assert_eq!(
            coercer.convert(Value::Double(whole as f64), ValueType::Long).unwrap(),
            Value::Long(whole)
        );
    }
}
