//! Canonical JSON: object keys sorted by byte order, no whitespace.
//!
//! Signatures cover the exact bytes sent, so the writer must not depend on
//! map iteration order or on serde_json features enabled elsewhere in the
//! dependency graph.

use serde_json::Value;

/// Canonical form of `value` as a string
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

/// Canonical form of `value` as bytes, ready to sign and send
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    canonical_json(value).into_bytes()
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
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
    // serde_json escapes a bare str compactly and deterministically
    match serde_json::to_string(s) {
        Ok(escaped) => out.push_str(&escaped),
        Err(_) => {
            out.push('"');
            out.push_str(s);
            out.push('"');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sorted_compact() {
        let value = json!({"version": 1, "id": "inv_1"});
        assert_eq!(canonical_json(&value), r#"{"id":"inv_1","version":1}"#);
    }

    #[test]
    fn test_nested_objects_and_arrays() {
        let value = json!({
            "b": [3, {"z": null, "a": true}],
            "a": {"y": 1.5, "x": "line\nbreak"}
        });

        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"x":"line\nbreak","y":1.5},"b":[3,{"a":true,"z":null}]}"#
        );
    }

    #[test]
    fn test_key_order_does_not_change_bytes() {
        let one: Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let two: Value = serde_json::from_str(r#"{ "b" : 2, "a" : 1 }"#).unwrap();
        assert_eq!(canonical_bytes(&one), canonical_bytes(&two));
    }
}
