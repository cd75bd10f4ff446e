//! Conversion between wire values and property-typed values.
//!
//! Both directions are total: a value that cannot be represented in the
//! target type degrades to the nearest representable value or `Null`
//! rather than failing. Arrays convert element-wise.

use crate::graph::{ScalarType, Value};
use crate::ua::Variant;

/// Map a wire value onto a property-typed value.
pub fn from_wire(variant: &Variant, target: &ScalarType) -> Value {
    if let ScalarType::Array(element) = target {
        return match variant {
            Variant::Array(items) => Value::List(
                items.iter().map(|item| from_wire(item, element)).collect(),
            ),
            Variant::Empty => Value::List(Vec::new()),
            single => Value::List(vec![from_wire(single, element)]),
        };
    }
    match variant {
        Variant::Empty => Value::Null,
        Variant::Bool(v) => match target {
            ScalarType::Bool => Value::Bool(*v),
            _ => coerce_int(*v as i64, target),
        },
        Variant::Byte(v) => coerce_int(*v as i64, target),
        Variant::Int16(v) => coerce_int(*v as i64, target),
        Variant::UInt16(v) => coerce_int(*v as i64, target),
        Variant::Int32(v) => coerce_int(*v as i64, target),
        Variant::UInt32(v) => coerce_int(*v as i64, target),
        Variant::Int64(v) => coerce_int(*v, target),
        Variant::UInt64(v) => match target {
            ScalarType::UInt16 | ScalarType::UInt32 | ScalarType::UInt64 => {
                Value::UInt(*v)
            }
            _ => coerce_int(i64::try_from(*v).unwrap_or(i64::MAX), target),
        },
        Variant::Float(v) => coerce_float(*v as f64, target),
        Variant::Double(v) => coerce_float(*v, target),
        Variant::String(v) => match target {
            ScalarType::Text => Value::Text(v.clone()),
            ScalarType::Bool => Value::Bool(v == "true" || v == "1"),
            _ => v
                .parse::<f64>()
                .map(|parsed| coerce_float(parsed, target))
                .unwrap_or(Value::Null),
        },
        Variant::Array(items) => Value::List(
            items.iter().map(|item| from_wire(item, target)).collect(),
        ),
    }
}

/// Map a property-typed value onto a wire value.
pub fn to_wire(value: &Value, target: &ScalarType) -> Variant {
    if let ScalarType::Array(element) = target {
        return match value {
            Value::List(items) => Variant::Array(
                items.iter().map(|item| to_wire(item, element)).collect(),
            ),
            Value::Null => Variant::Array(Vec::new()),
            single => Variant::Array(vec![to_wire(single, element)]),
        };
    }
    let (int, float): (i64, f64) = match value {
        Value::Null => return Variant::Empty,
        Value::Bool(v) => (*v as i64, *v as u8 as f64),
        Value::Int(v) => (*v, *v as f64),
        Value::UInt(v) => {
            if let ScalarType::UInt64 = target {
                return Variant::UInt64(*v);
            }
            (i64::try_from(*v).unwrap_or(i64::MAX), *v as f64)
        }
        Value::Float(v) => (*v as i64, *v),
        Value::Text(v) => {
            return match target {
                ScalarType::Text => Variant::String(v.clone()),
                ScalarType::Bool => Variant::Bool(v == "true" || v == "1"),
                _ => v
                    .parse::<f64>()
                    .map(|parsed| to_wire(&Value::Float(parsed), target))
                    .unwrap_or(Variant::Empty),
            };
        }
        Value::List(items) => {
            return Variant::Array(
                items.iter().map(|item| to_wire(item, target)).collect(),
            );
        }
    };
    match target {
        ScalarType::Bool => Variant::Bool(int != 0),
        ScalarType::Int16 => {
            Variant::Int16(int.clamp(i16::MIN as i64, i16::MAX as i64) as i16)
        }
        ScalarType::Int32 => {
            Variant::Int32(int.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
        }
        ScalarType::Int64 => Variant::Int64(int),
        ScalarType::UInt16 => {
            Variant::UInt16(int.clamp(0, u16::MAX as i64) as u16)
        }
        ScalarType::UInt32 => {
            Variant::UInt32(int.clamp(0, u32::MAX as i64) as u32)
        }
        ScalarType::UInt64 => Variant::UInt64(int.max(0) as u64),
        ScalarType::Float => Variant::Float(float as f32),
        ScalarType::Double => Variant::Double(float),
        ScalarType::Text => Variant::String(value.to_string()),
        ScalarType::Array(_) => unreachable!("handled above"),
    }
}

/// Infer the property type equivalent to a wire value, for dynamic
/// properties. Empty values carry no type information.
pub fn infer_scalar_type(variant: &Variant) -> Option<ScalarType> {
    match variant {
        Variant::Empty => None,
        Variant::Bool(_) => Some(ScalarType::Bool),
        Variant::Byte(_) | Variant::UInt16(_) => Some(ScalarType::UInt16),
        Variant::Int16(_) => Some(ScalarType::Int16),
        Variant::Int32(_) => Some(ScalarType::Int32),
        Variant::UInt32(_) => Some(ScalarType::UInt32),
        Variant::Int64(_) => Some(ScalarType::Int64),
        Variant::UInt64(_) => Some(ScalarType::UInt64),
        Variant::Float(_) => Some(ScalarType::Float),
        Variant::Double(_) => Some(ScalarType::Double),
        Variant::String(_) => Some(ScalarType::Text),
        Variant::Array(items) => {
            let element = infer_scalar_type(items.first()?)?;
            Some(ScalarType::Array(Box::new(element)))
        }
    }
}

fn coerce_int(v: i64, target: &ScalarType) -> Value {
    match target {
        ScalarType::Bool => Value::Bool(v != 0),
        ScalarType::Int16 | ScalarType::Int32 | ScalarType::Int64 => {
            Value::Int(v)
        }
        ScalarType::UInt16 | ScalarType::UInt32 | ScalarType::UInt64 => {
            Value::UInt(v.max(0) as u64)
        }
        ScalarType::Float | ScalarType::Double => Value::Float(v as f64),
        ScalarType::Text => Value::Text(v.to_string()),
        ScalarType::Array(element) => {
            Value::List(vec![coerce_int(v, element)])
        }
    }
}

fn coerce_float(v: f64, target: &ScalarType) -> Value {
    match target {
        ScalarType::Bool => Value::Bool(v != 0.0),
        ScalarType::Int16 | ScalarType::Int32 | ScalarType::Int64 => {
            Value::Int(v as i64)
        }
        ScalarType::UInt16 | ScalarType::UInt32 | ScalarType::UInt64 => {
            Value::UInt(if v < 0.0 { 0 } else { v as u64 })
        }
        ScalarType::Float | ScalarType::Double => Value::Float(v),
        ScalarType::Text => Value::Text(v.to_string()),
        ScalarType::Array(element) => {
            Value::List(vec![coerce_float(v, element)])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_round_trip() {
        let value = from_wire(&Variant::Double(21.5), &ScalarType::Double);
        assert_eq!(value, Value::Float(21.5));
        assert_eq!(
            to_wire(&value, &ScalarType::Double),
            Variant::Double(21.5)
        );
    }

    #[test]
    fn arrays_convert_element_wise() {
        let wire = Variant::Array(vec![
            Variant::Double(1.0),
            Variant::Double(2.0),
            Variant::Double(3.1),
        ]);
        let target = ScalarType::Array(Box::new(ScalarType::Double));
        let value = from_wire(&wire, &target);
        assert_eq!(
            value,
            Value::List(vec![
                Value::Float(1.0),
                Value::Float(2.0),
                Value::Float(3.1),
            ])
        );
        assert_eq!(to_wire(&value, &target), wire);
    }

    #[test]
    fn array_equality_is_structural() {
        let target = ScalarType::Array(Box::new(ScalarType::Double));
        let a = from_wire(
            &Variant::Array(vec![Variant::Double(1.0), Variant::Double(2.0)]),
            &target,
        );
        let b = from_wire(
            &Variant::Array(vec![Variant::Double(1.0), Variant::Double(2.0)]),
            &target,
        );
        let c = from_wire(
            &Variant::Array(vec![Variant::Double(1.0), Variant::Double(2.1)]),
            &target,
        );
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn conversion_is_total() {
        assert_eq!(
            from_wire(&Variant::String("oops".into()), &ScalarType::Double),
            Value::Null
        );
        assert_eq!(to_wire(&Value::Null, &ScalarType::Int32), Variant::Empty);
        assert_eq!(
            to_wire(&Value::Int(-5), &ScalarType::UInt16),
            Variant::UInt16(0)
        );
    }

    #[test]
    fn type_inference() {
        assert_eq!(
            infer_scalar_type(&Variant::Double(0.0)),
            Some(ScalarType::Double)
        );
        assert_eq!(infer_scalar_type(&Variant::Empty), None);
        assert_eq!(
            infer_scalar_type(&Variant::Array(vec![Variant::Int32(1)])),
            Some(ScalarType::Array(Box::new(ScalarType::Int32)))
        );
    }
}
