//! Node codec
//!
//! Decides whether a value is embedded ("inline") in its parent's record or
//! needs a dedicated record, and converts scalars between [`Value`] and the
//! storage-neutral [`StoredValue`] form.
//!
//! | Value | Inline when | Encoded as |
//! |-------|-------------|------------|
//! | number, boolean | always | native |
//! | date | always | `{kind: DateTime, value: epoch-ms}` |
//! | string | UTF-8 length < max | native |
//! | reference | path string length < max | `{kind: Reference, value: path}` |
//! | binary | byte length < max | `{kind: Binary, value: base64}` |
//! | object, array | empty | empty-container marker |
//!
//! Strings, binary and references that do not fit inline use the same
//! encoding inside their own record.

use crate::error::{ArborError, ArborResult};
use crate::path::NodePath;
use crate::record::{StoredValue, TypedPayload, TypedValue};
use crate::types::NodeType;
use crate::value::Value;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{TimeZone, Utc};

/// Check whether a value can be embedded in its parent's record
///
/// `Null` and `Void` are never stored and report `true`.
pub fn fits_inline(value: &Value, max_inline_size: usize) -> bool {
    match value {
        Value::Null | Value::Void => true,
        Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::DateTime(_) => true,
        Value::String(s) => s.len() < max_inline_size,
        Value::Reference(path) => path.to_path_string().len() < max_inline_size,
        Value::Binary(bytes) => bytes.len() < max_inline_size,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

/// Encode a scalar (or empty container) to its storage-neutral form
///
/// Returns `None` for `Null`, `Void` and non-empty containers, which have
/// no scalar encoding.
pub fn encode_inline_scalar(value: &Value) -> Option<StoredValue> {
    let stored = match value {
        Value::Null | Value::Void => return None,
        Value::Bool(b) => StoredValue::Bool(*b),
        Value::Int(i) => StoredValue::Int(*i),
        Value::Float(f) => StoredValue::Float(*f),
        Value::String(s) => StoredValue::String(s.clone()),
        Value::DateTime(dt) => StoredValue::Typed(TypedValue {
            kind: NodeType::DateTime,
            value: TypedPayload::Millis(dt.timestamp_millis()),
        }),
        Value::Binary(bytes) => StoredValue::Typed(TypedValue {
            kind: NodeType::Binary,
            value: TypedPayload::Text(BASE64.encode(bytes)),
        }),
        Value::Reference(path) => StoredValue::Typed(TypedValue {
            kind: NodeType::Reference,
            value: TypedPayload::Text(path.to_path_string()),
        }),
        Value::Array(items) if items.is_empty() => StoredValue::EmptyArray,
        Value::Object(map) if map.is_empty() => StoredValue::EmptyObject,
        Value::Array(_) | Value::Object(_) => return None,
    };
    Some(stored)
}

/// Decode a storage-neutral scalar back to a [`Value`]
///
/// Exact inverse of [`encode_inline_scalar`] (dates at millisecond precision).
pub fn decode_inline_scalar(stored: &StoredValue) -> ArborResult<Value> {
    let value = match stored {
        StoredValue::String(s) => Value::String(s.clone()),
        StoredValue::Int(i) => Value::Int(*i),
        StoredValue::Float(f) => Value::Float(*f),
        StoredValue::Bool(b) => Value::Bool(*b),
        StoredValue::EmptyObject => Value::object(),
        StoredValue::EmptyArray => Value::array(),
        StoredValue::Typed(typed) => decode_typed(typed)?,
    };
    Ok(value)
}

fn decode_typed(typed: &TypedValue) -> ArborResult<Value> {
    match (typed.kind, &typed.value) {
        (NodeType::DateTime, TypedPayload::Millis(ms)) => Utc
            .timestamp_millis_opt(*ms)
            .single()
            .map(Value::DateTime)
            .ok_or_else(|| ArborError::Serialization(format!("invalid date value {}", ms))),
        (NodeType::Binary, TypedPayload::Text(encoded)) => BASE64
            .decode(encoded)
            .map(Value::Binary)
            .map_err(|e| ArborError::Serialization(format!("invalid binary value: {}", e))),
        (NodeType::Reference, TypedPayload::Text(path)) => {
            Ok(Value::Reference(NodePath::concrete(path)?))
        }
        (kind, payload) => Err(ArborError::Serialization(format!(
            "unexpected typed payload {:?} for {}",
            payload, kind
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MAX: usize = 50;

    #[test]
    fn test_string_inline_boundary() {
        assert!(fits_inline(&Value::String("x".repeat(49)), MAX));
        assert!(!fits_inline(&Value::String("x".repeat(50)), MAX));
        assert!(!fits_inline(&Value::String("x".repeat(51)), MAX));
    }

    #[test]
    fn test_string_boundary_counts_utf8_bytes() {
        // 25 two-byte characters = 50 bytes
        let s = "é".repeat(25);
        assert_eq!(s.chars().count(), 25);
        assert!(!fits_inline(&Value::String(s), MAX));
    }

    #[test]
    fn test_binary_and_reference_boundary() {
        assert!(fits_inline(&Value::Binary(vec![0; 49]), MAX));
        assert!(!fits_inline(&Value::Binary(vec![0; 50]), MAX));

        let short: NodePath = "users/alice".parse().unwrap();
        assert!(fits_inline(&Value::Reference(short), MAX));
        let long = NodePath::root().key("k".repeat(60));
        assert!(!fits_inline(&Value::Reference(long), MAX));
    }

    #[test]
    fn test_numbers_booleans_dates_always_inline() {
        assert!(fits_inline(&Value::Int(i64::MAX), 1));
        assert!(fits_inline(&Value::Float(1e300), 1));
        assert!(fits_inline(&Value::Bool(false), 1));
        assert!(fits_inline(&Value::DateTime(Utc::now()), 1));
    }

    #[test]
    fn test_containers_inline_only_when_empty() {
        assert!(fits_inline(&Value::object(), MAX));
        assert!(fits_inline(&Value::array(), MAX));
        assert!(!fits_inline(&Value::object_from([("a", 1)]), MAX));
        assert!(!fits_inline(&Value::Array(vec![Value::Int(1)]), MAX));
    }

    #[test]
    fn test_encode_typed_scalars() {
        let dt = Utc.timestamp_millis_opt(1_700_000_000_123).single().unwrap();
        assert_eq!(
            encode_inline_scalar(&Value::DateTime(dt)),
            Some(StoredValue::Typed(TypedValue {
                kind: NodeType::DateTime,
                value: TypedPayload::Millis(1_700_000_000_123),
            }))
        );
        assert_eq!(
            encode_inline_scalar(&Value::Binary(b"hi".to_vec())),
            Some(StoredValue::Typed(TypedValue {
                kind: NodeType::Binary,
                value: TypedPayload::Text("aGk=".to_string()),
            }))
        );
        let target: NodePath = "users[0]".parse().unwrap();
        assert_eq!(
            encode_inline_scalar(&Value::Reference(target)),
            Some(StoredValue::Typed(TypedValue {
                kind: NodeType::Reference,
                value: TypedPayload::Text("users[0]".to_string()),
            }))
        );
    }

    #[test]
    fn test_encode_rejects_non_scalars() {
        assert_eq!(encode_inline_scalar(&Value::Null), None);
        assert_eq!(encode_inline_scalar(&Value::Void), None);
        assert_eq!(encode_inline_scalar(&Value::object_from([("a", 1)])), None);
    }

    #[test]
    fn test_decode_inverse() {
        let dt = Utc.timestamp_millis_opt(86_400_000).single().unwrap();
        let values = vec![
            Value::String("hello".into()),
            Value::Int(-3),
            Value::Float(2.5),
            Value::Bool(true),
            Value::DateTime(dt),
            Value::Binary(vec![0, 255, 7]),
            Value::Reference("a/b[2]".parse().unwrap()),
            Value::object(),
            Value::array(),
        ];
        for value in values {
            let stored = encode_inline_scalar(&value).unwrap();
            assert_eq!(decode_inline_scalar(&stored).unwrap(), value);
        }
    }

    #[test]
    fn test_decode_invalid_payloads() {
        let bad_binary = StoredValue::Typed(TypedValue {
            kind: NodeType::Binary,
            value: TypedPayload::Text("!!not base64!!".to_string()),
        });
        assert!(decode_inline_scalar(&bad_binary).is_err());

        let mismatched = StoredValue::Typed(TypedValue {
            kind: NodeType::DateTime,
            value: TypedPayload::Text("yesterday".to_string()),
        });
        assert!(decode_inline_scalar(&mismatched).is_err());
    }

    proptest! {
        #[test]
        fn prop_binary_roundtrip(bytes in proptest::collection::vec(any::<u8>(), 0..200)) {
            let value = Value::Binary(bytes);
            let stored = encode_inline_scalar(&value).unwrap();
            prop_assert_eq!(decode_inline_scalar(&stored).unwrap(), value);
        }

        #[test]
        fn prop_string_fits_iff_shorter_than_max(s in ".{0,80}", max in 1usize..80) {
            let fits = fits_inline(&Value::String(s.clone()), max);
            prop_assert_eq!(fits, s.len() < max);
        }
    }
}
