//! Canonical JSON serialization shared by every hashing and fingerprinting
//! operation: keys sorted recursively in ascending code-point order,
//! non-ASCII escaped, no insignificant whitespace.

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a JSON value canonically. Two structurally equal values produce
/// byte-identical output regardless of object key insertion order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

/// SHA-256 of a string, as lowercase hex.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Deterministic hash over a tool-argument mapping.
pub fn hash_args(args: &BTreeMap<String, Value>) -> String {
    let object = Value::Object(
        args.iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<serde_json::Map<_, _>>(),
    );
    sha256_hex(&canonical_json(&object))
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            // BTreeMap iteration gives ascending code-point key order.
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (idx, (key, item)) in sorted.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(item, out);
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                use std::fmt::Write;
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c if c.is_ascii() => out.push(c),
            c => {
                // Escape non-ASCII, using surrogate pairs beyond the BMP.
                use std::fmt::Write;
                let mut buf = [0u16; 2];
                for unit in c.encode_utf16(&mut buf) {
                    let _ = write!(out, "\\u{unit:04x}");
                }
            }
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn objects_are_key_sorted_recursively() {
        let value = json!({"b": {"d": 1, "c": 2}, "a": [1, {"z": 0, "y": 1}]});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":[1,{"y":1,"z":0}],"b":{"c":2,"d":1}}"#
        );
    }

    #[test]
    fn non_ascii_is_escaped() {
        assert_eq!(canonical_json(&json!("héllo")), "\"h\\u00e9llo\"");
        assert_eq!(canonical_json(&json!("🎉")), "\"\\ud83c\\udf89\"");
    }

    #[test]
    fn hash_is_stable_across_insertion_order() {
        let mut first = BTreeMap::new();
        first.insert("alpha".to_string(), json!({"k": 1, "j": 2}));
        first.insert("beta".to_string(), json!([1, 2, 3]));

        let mut second = BTreeMap::new();
        second.insert("beta".to_string(), json!([1, 2, 3]));
        second.insert("alpha".to_string(), json!({"j": 2, "k": 1}));

        assert_eq!(hash_args(&first), hash_args(&second));
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
