//! Field key and value validation.
//!
//! Validation runs at the moment a field-affecting method is invoked, never
//! at compile or save time, so the caller gets immediate feedback for the
//! exact call that was wrong.

use crate::error::{CoreResult, Error};
use crate::value::{Number, Value};

/// Characters that may not appear in a field key.
const FORBIDDEN: [char; 3] = ['$', '.', '!'];

/// Checks that a field key is structurally legal.
///
/// Keys containing `$`, `.`, or `!` collide with the wire format's operator
/// and path syntax and are rejected. Empty keys are rejected as well.
pub fn validate_key(key: &str) -> CoreResult<()> {
    if key.is_empty() {
        return Err(Error::invalid_key(key, "key is empty"));
    }
    for c in FORBIDDEN {
        if key.contains(c) {
            return Err(Error::invalid_key(key, format!("contains '{c}'")));
        }
    }
    Ok(())
}

/// Checks that a value is representable on the wire.
///
/// Floats must be finite, and nested documents obey the same key rules as
/// top-level fields. Lists and maps are validated recursively.
pub fn validate_value(value: &Value) -> CoreResult<()> {
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) | Value::Binary(_) | Value::Relation(_) => {
            Ok(())
        }
        Value::Number(n) => {
            if n.is_finite() {
                Ok(())
            } else {
                Err(Error::invalid_value("number is not finite"))
            }
        }
        Value::List(items) => {
            for item in items {
                validate_value(item)?;
            }
            Ok(())
        }
        Value::Map(map) => {
            for (key, nested) in map {
                validate_key(key)?;
                validate_value(nested)?;
            }
            Ok(())
        }
    }
}

/// Validates a key/value pair in one step.
pub fn validate_entry(key: &str, value: &Value) -> CoreResult<()> {
    validate_key(key)?;
    validate_value(value)
}

/// Validates an increment delta.
pub fn validate_delta(key: &str, delta: Number) -> CoreResult<()> {
    validate_key(key)?;
    if delta.is_finite() {
        Ok(())
    } else {
        Err(Error::invalid_value("increment delta is not finite"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Document;

    #[test]
    fn rejects_forbidden_characters() {
        for key in ["a.b", "a$b", "a!b", "$set", ""] {
            assert!(validate_key(key).is_err(), "key {key:?} should be invalid");
        }
    }

    #[test]
    fn accepts_plain_keys() {
        for key in ["name", "user_name", "camelCase", "n0"] {
            assert!(validate_key(key).is_ok());
        }
    }

    #[test]
    fn rejects_non_finite_floats() {
        assert!(validate_value(&Value::from(f64::NAN)).is_err());
        assert!(validate_value(&Value::from(f64::INFINITY)).is_err());
        assert!(validate_value(&Value::from(1.5)).is_ok());
    }

    #[test]
    fn rejects_bad_keys_in_nested_documents() {
        let mut inner = Document::new();
        inner.insert("a.b".into(), Value::from(1i64));
        let err = validate_value(&Value::Map(inner)).unwrap_err();
        assert!(matches!(err, Error::InvalidKey { .. }));
    }

    #[test]
    fn validates_list_elements() {
        let bad = Value::List(vec![Value::from(1i64), Value::from(f64::NAN)]);
        assert!(validate_value(&bad).is_err());
    }
}
