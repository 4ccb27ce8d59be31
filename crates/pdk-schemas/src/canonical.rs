//! Canonical JSON encoding.
//!
//! One stable byte encoding per value: object keys emitted in ascending
//! order, array order preserved, compact separators, no whitespace. The
//! config loader hashes this encoding and the run journal writes it, so
//! equal values always compare byte-for-byte.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

/// Encode a JSON value canonically.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

/// Serialize any value, then encode canonically.
pub fn canonical_json_of<T: Serialize>(value: &T) -> Result<String> {
    let raw = serde_json::to_value(value).context("value is not representable as JSON")?;
    Ok(canonical_json(&raw))
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            // View the entries through a BTreeMap so emission order is the
            // key order, without building a sorted copy of the tree.
            let ordered: BTreeMap<&str, &Value> =
                map.iter().map(|(k, v)| (k.as_str(), v)).collect();
            out.push('{');
            for (i, (key, inner)) in ordered.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(key).to_string());
                out.push(':');
                write_value(inner, out);
            }
            out.push('}');
        }
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
        // Scalars already have a single compact rendering.
        leaf => out.push_str(&leaf.to_string()),
    }
}
