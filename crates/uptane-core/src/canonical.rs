//! Canonical JSON serialization.
//!
//! Every signature and key id in the Uptane wire format is computed over
//! this exact byte form: object keys sorted lexicographically, no
//! insignificant whitespace, UTF-8. All verification paths in this crate go
//! through the single writer below; no other serialization is acceptable as
//! a signing input.

use serde_json::Value;

/// Serializes a JSON value into its canonical byte form.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    write_value(value, &mut out);
    out
}

/// Convenience wrapper returning the canonical form as a `String`.
pub fn canonical_string(value: &Value) -> String {
    // The writer only ever emits valid UTF-8 (serde_json escapes strings).
    String::from_utf8(canonical_bytes(value)).expect("canonical writer emits UTF-8")
}

/// Recursively writes one value in canonical form.
fn write_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push(b'[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                write_value(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            // serde_json's map may or may not preserve insertion order
            // depending on build features, so the keys are sorted explicitly.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push(b'{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                write_string(key, out);
                out.push(b':');
                write_value(&map[key], out);
            }
            out.push(b'}');
        }
    }
}

/// Writes a JSON string with serde_json's escaping rules.
fn write_string(s: &str, out: &mut Vec<u8>) {
    let escaped = serde_json::to_string(s).expect("string serialization is infallible");
    out.extend_from_slice(escaped.as_bytes());
}
