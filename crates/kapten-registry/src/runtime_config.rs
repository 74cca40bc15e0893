//! Resolver for the free-form `config` block.
//!
//! Two things distinguish the block from plain YAML: `include` entries
//! pull in other JSON/YAML files (deep-merged before sibling keys), and
//! strings of the form `module.path:symbol()` denote host-language
//! callables. Resolution is two-stage: this module only *parses* callable
//! strings into [`ConfigValue::Call`]; evaluating them is left to whoever
//! knows the target runtime.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::Error;

static CALLABLE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<module>[A-Za-z_][\w.]*):(?P<symbol>[A-Za-z_][\w.]*)\(\)$")
        .expect("callable pattern is valid")
});

/// A resolved configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    /// A deferred `module:symbol()` callable reference.
    Call { module: String, symbol: String },
    List(Vec<ConfigValue>),
    Map(BTreeMap<String, ConfigValue>),
}

impl ConfigValue {
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        match self {
            ConfigValue::Map(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(value) => Some(value),
            _ => None,
        }
    }
}

/// Resolve a `config` block: load and merge includes (relative to
/// `base_dir`), then parse callable strings. Include cycles are an error.
pub fn resolve_config(block: &serde_json::Value, base_dir: &Utf8Path) -> Result<ConfigValue, Error> {
    let mut stack = Vec::new();
    resolve_value(block, base_dir, &mut stack)
}

fn resolve_value(
    value: &serde_json::Value,
    base_dir: &Utf8Path,
    stack: &mut Vec<Utf8PathBuf>,
) -> Result<ConfigValue, Error> {
    use serde_json::Value;
    Ok(match value {
        Value::Null => ConfigValue::Null,
        Value::Bool(value) => ConfigValue::Bool(*value),
        Value::Number(value) => ConfigValue::Number(value.clone()),
        Value::String(value) => resolve_string(value),
        Value::Array(items) => ConfigValue::List(
            items
                .iter()
                .map(|item| resolve_value(item, base_dir, stack))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut merged = BTreeMap::new();
            if let Some(include) = map.get("include") {
                for entry in normalize_includes(include)? {
                    let included = load_include(base_dir, &entry, stack)?;
                    let ConfigValue::Map(included) = included else {
                        return Err(Error::IncludeNotMapping {
                            path: base_dir.join(&entry),
                        });
                    };
                    merged = deep_merge(merged, included);
                }
            }
            let mut current = BTreeMap::new();
            for (key, value) in map {
                if key == "include" {
                    continue;
                }
                current.insert(key.clone(), resolve_value(value, base_dir, stack)?);
            }
            ConfigValue::Map(deep_merge(merged, current))
        }
    })
}

fn resolve_string(value: &str) -> ConfigValue {
    match CALLABLE_PATTERN.captures(value.trim()) {
        Some(captures) => ConfigValue::Call {
            module: captures["module"].to_owned(),
            symbol: captures["symbol"].to_owned(),
        },
        None => ConfigValue::String(value.to_owned()),
    }
}

fn normalize_includes(include: &serde_json::Value) -> Result<Vec<String>, Error> {
    match include {
        serde_json::Value::String(entry) => Ok(vec![entry.clone()]),
        serde_json::Value::Array(entries) => entries
            .iter()
            .map(|entry| {
                entry
                    .as_str()
                    .map(str::to_owned)
                    .ok_or(Error::IncludeNotString)
            })
            .collect(),
        _ => Err(Error::IncludeNotString),
    }
}

fn load_include(
    base_dir: &Utf8Path,
    entry: &str,
    stack: &mut Vec<Utf8PathBuf>,
) -> Result<ConfigValue, Error> {
    let path = base_dir.join(entry);
    if stack.contains(&path) {
        return Err(Error::IncludeCycle { path });
    }
    if !path.is_file() {
        return Err(Error::IncludeMissing { path });
    }
    let raw = std::fs::read_to_string(&path).map_err(|source| Error::Io {
        path: path.clone(),
        source,
    })?;
    let value: serde_json::Value = match path.extension() {
        Some("json") => serde_json::from_str(&raw).map_err(|source| Error::ParseJson {
            path: path.clone(),
            source,
        })?,
        _ => serde_yaml::from_str(&raw).map_err(|source| Error::Parse {
            path: path.clone(),
            source,
        })?,
    };
    stack.push(path);
    let resolved = resolve_value(&value, base_dir, stack);
    stack.pop();
    resolved
}

fn deep_merge(
    mut base: BTreeMap<String, ConfigValue>,
    other: BTreeMap<String, ConfigValue>,
) -> BTreeMap<String, ConfigValue> {
    for (key, value) in other {
        match (base.remove(&key), value) {
            (Some(ConfigValue::Map(existing)), ConfigValue::Map(incoming)) => {
                base.insert(key, ConfigValue::Map(deep_merge(existing, incoming)));
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
    base
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn callable_strings_parse_to_tagged_calls() {
        let block = json!({
            "engine": "src.utils:get_engine()",
            "plain": "just a string",
            "nested.call": "a.b.c:d.e()",
        });
        let resolved = resolve_config(&block, Utf8Path::new(".")).unwrap();
        assert_eq!(
            resolved.get("engine"),
            Some(&ConfigValue::Call {
                module: "src.utils".to_owned(),
                symbol: "get_engine".to_owned(),
            })
        );
        assert_eq!(
            resolved.get("plain"),
            Some(&ConfigValue::String("just a string".to_owned()))
        );
        assert_eq!(
            resolved.get("nested.call"),
            Some(&ConfigValue::Call {
                module: "a.b.c".to_owned(),
                symbol: "d.e".to_owned(),
            })
        );
    }

    #[test]
    fn includes_merge_under_sibling_keys() {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::write(
            base.join("defaults.yaml"),
            "retries: 3\nlimits:\n  memory: 512\n  cpu: 1\n",
        )
        .unwrap();
        let block = json!({
            "include": ["defaults.yaml"],
            "limits": {"cpu": 4},
        });
        let resolved = resolve_config(&block, base).unwrap();
        assert_eq!(
            resolved.get("retries"),
            Some(&ConfigValue::Number(3.into()))
        );
        let limits = resolved.get("limits").unwrap();
        assert_eq!(limits.get("cpu"), Some(&ConfigValue::Number(4.into())));
        assert_eq!(limits.get("memory"), Some(&ConfigValue::Number(512.into())));
    }

    #[test]
    fn include_cycles_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::write(base.join("a.yaml"), "include: b.yaml\n").unwrap();
        std::fs::write(base.join("b.yaml"), "include: a.yaml\n").unwrap();
        let block = json!({"include": "a.yaml"});
        let err = resolve_config(&block, base).unwrap_err();
        assert!(matches!(err, Error::IncludeCycle { .. }));
    }

    #[test]
    fn missing_includes_are_reported() {
        let block = json!({"include": "nope.yaml"});
        let err = resolve_config(&block, Utf8Path::new("/nonexistent")).unwrap_err();
        assert!(matches!(err, Error::IncludeMissing { .. }));
    }

    #[test]
    fn diamond_includes_are_not_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::write(base.join("shared.yaml"), "level: debug\n").unwrap();
        std::fs::write(base.join("a.yaml"), "include: shared.yaml\na: 1\n").unwrap();
        std::fs::write(base.join("b.yaml"), "include: shared.yaml\nb: 2\n").unwrap();
        let block = json!({"include": ["a.yaml", "b.yaml"]});
        let resolved = resolve_config(&block, base).unwrap();
        assert_eq!(
            resolved.get("level"),
            Some(&ConfigValue::String("debug".to_owned()))
        );
    }
}
