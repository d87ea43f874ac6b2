//! Canonical JSON encoding for signed key material.
//!
//! Signing and verification must agree on the exact bytes, so both sides go
//! through the same procedure:
//! 1. Take the "unsigned view" of the object (drop `signatures` and `unsigned`)
//! 2. Encode with object keys sorted by code point and no insignificant whitespace
//! 3. Reject floating-point numbers, which have no single canonical form

use serde_json::Value;

use crate::error::CryptoError;

/// Top-level members excluded from the signed bytes.
pub const UNSIGNED_FIELDS: [&str; 2] = ["signatures", "unsigned"];

/// Encode `value` as canonical JSON.
pub fn canonical_json(value: &Value) -> Result<String, CryptoError> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

/// Bytes a signature over `value` is computed on.
pub fn signable_bytes(value: &Value) -> Result<Vec<u8>, CryptoError> {
    let unsigned_view = match value {
        Value::Object(map) => {
            let mut map = map.clone();
            for field in UNSIGNED_FIELDS {
                map.remove(field);
            }
            Value::Object(map)
        }
        other => other.clone(),
    };
    canonical_json(&unsigned_view).map(String::into_bytes)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), CryptoError> {
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => {
            out.push_str(&serde_json::to_string(value)?);
        }
        Value::Number(number) => {
            if number.is_f64() {
                return Err(CryptoError::Canonicalization(format!(
                    "floating-point value {number} has no canonical form"
                )));
            }
            out.push_str(&number.to_string());
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(item, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}
