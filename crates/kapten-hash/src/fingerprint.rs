//! Content-addressed fingerprints.
//!
//! The fingerprint of a value is the SHA-256 of its canonical JSON
//! serialization: object keys sorted, no whitespace. This is a wire
//! contract — stored versions are compared against freshly computed
//! ones across runs and hosts, so changing the serialization is a
//! cache-invalidating breaking change.

use camino::Utf8Path;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::Error;

/// Canonical JSON serialization: recursively sorted object keys, compact
/// separators.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(&mut out, value);
    out
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(value) => out.push_str(if *value { "true" } else { "false" }),
        Value::Number(value) => out.push_str(&value.to_string()),
        // Display for Value emits compact JSON with proper escaping.
        Value::String(value) => out.push_str(&Value::String(value.clone()).to_string()),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by_key(|(key, _)| *key);
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(out, item);
            }
            out.push('}');
        }
    }
}

/// Fingerprint of a JSON value: `hex(sha256(canonical_json(value)))`.
pub fn fingerprint(value: &Value) -> String {
    fingerprint_str(&canonical_json(value))
}

/// Fingerprint of a raw string. Used to derive the `*_version` fields
/// from the serialized `*_hashes` strings stored on a task record.
pub fn fingerprint_str(serialized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA-256 of a file's contents, hex-encoded.
pub fn hash_file(path: &Utf8Path) -> Result<String, Error> {
    let contents = std::fs::read(path).map_err(|source| Error::Io {
        path: path.to_owned(),
        source,
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&contents);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let value = json!({"b": {"z": 1, "a": [true, null]}, "a": "x"});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":"x","b":{"a":[true,null],"z":1}}"#
        );
    }

    #[test]
    fn fingerprint_is_insertion_order_independent() {
        let mut first = serde_json::Map::new();
        first.insert("alpha".to_owned(), json!("1"));
        first.insert("beta".to_owned(), json!("2"));
        let mut second = serde_json::Map::new();
        second.insert("beta".to_owned(), json!("2"));
        second.insert("alpha".to_owned(), json!("1"));
        assert_eq!(
            fingerprint(&Value::Object(first)),
            fingerprint(&Value::Object(second))
        );
    }

    #[test]
    fn fingerprint_distinguishes_values() {
        assert_ne!(fingerprint(&json!([1, 2])), fingerprint(&json!([2, 1])));
        assert_ne!(fingerprint(&json!("a")), fingerprint(&json!("b")));
    }

    #[test]
    fn hash_file_changes_with_any_byte() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("f.txt");
        std::fs::write(&path, "content").unwrap();
        let before = hash_file(&path).unwrap();
        std::fs::write(&path, "content!").unwrap();
        let after = hash_file(&path).unwrap();
        assert_ne!(before, after);
    }
}
