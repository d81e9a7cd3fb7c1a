//! Conversion between plain JSON values and `yrs::Any`.
//!
//! Integers keep their 64-bit integer identity (`Any::BigInt`); every other
//! number is stored as a double.

use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use yrs::Any;

pub fn to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Any::BigInt(i),
            None => Any::Number(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => Any::from(s.clone()),
        Value::Array(items) => Any::from(items.iter().map(to_any).collect::<Vec<Any>>()),
        Value::Object(fields) => Any::from(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), to_any(v)))
                .collect::<HashMap<String, Any>>(),
        ),
    }
}

pub fn from_any(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => Number::from_f64(*n).map(Value::Number).unwrap_or(Value::Null),
        Any::BigInt(i) => Value::from(*i),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(from_any).collect()),
        Any::Map(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), from_any(v)))
                .collect::<Map<String, Value>>(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integers_stay_integers() {
        let value = json!({"count": 3, "ratio": 0.5, "big": i64::MAX});
        let back = from_any(&to_any(&value));
        assert_eq!(back, value);
        assert!(back["count"].is_i64());
    }

    #[test]
    fn test_nested_structures() {
        let value = json!({
            "id": "n1",
            "tags": ["a", "b", null],
            "meta": {"pinned": true, "rank": [1, 2.5]}
        });
        assert_eq!(from_any(&to_any(&value)), value);
    }

    #[test]
    fn test_non_finite_numbers_become_null() {
        assert_eq!(from_any(&Any::Number(f64::INFINITY)), Value::Null);
        assert_eq!(from_any(&Any::Undefined), Value::Null);
    }
}
