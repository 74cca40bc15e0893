#![deny(clippy::all)]

//! Immutable view of the pipeline configuration.
//!
//! A pipeline is described by one or more YAML documents carrying three
//! top-level blocks: `settings` (directory roots, flow type, backing
//! store), `tasks` (per-task attributes), and `graphs` (per-graph
//! dependency maps). An optional free-form `config` block is resolved
//! separately, see [`resolve_config`].

mod config;
mod runtime_config;

use camino::{Utf8Path, Utf8PathBuf};
pub use config::{
    ArgSpec, DaskWorker, DbKind, DependencySpec, Graph, PipelineDoc, ScriptSpec, Settings,
    TaskConfig,
};
pub use runtime_config::{resolve_config, ConfigValue};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum Error {
    #[error("task '{name}' not found in list of tasks: {known:?}")]
    UnknownTask { name: String, known: Vec<String> },
    #[error("graph '{name}' not found in list of graphs: {known:?}")]
    UnknownGraph { name: String, known: Vec<String> },
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    ParseJson {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid merged pipeline configuration: {0}")]
    InvalidDocument(#[source] serde_yaml::Error),
    #[error("conflicting values for '{key}' while merging pipeline configs")]
    MergeConflict { key: String },
    #[error("config include cycle detected at {path}")]
    IncludeCycle { path: Utf8PathBuf },
    #[error("config include '{path}' not found")]
    IncludeMissing { path: Utf8PathBuf },
    #[error("config include '{path}' did not decode to a mapping")]
    IncludeNotMapping { path: Utf8PathBuf },
    #[error("config include entries must be strings")]
    IncludeNotString,
}

/// Parsed, immutable pipeline configuration with lookup helpers.
#[derive(Debug)]
pub struct TaskRegistry {
    doc: PipelineDoc,
}

impl TaskRegistry {
    pub fn new(doc: PipelineDoc) -> Self {
        Self { doc }
    }

    /// Read a single pipeline configuration file.
    pub fn load(path: &Utf8Path) -> Result<Self, Error> {
        Self::load_many(&[path.to_owned()])
    }

    /// Read and deep-merge several pipeline configuration files.
    /// A key carrying two different scalar values is a conflict.
    pub fn load_many(paths: &[Utf8PathBuf]) -> Result<Self, Error> {
        let mut merged = serde_yaml::Value::Null;
        for path in paths {
            info!("Reading tasks config from {path}");
            let raw = std::fs::read_to_string(path).map_err(|source| Error::Io {
                path: path.clone(),
                source,
            })?;
            let value: serde_yaml::Value =
                serde_yaml::from_str(&raw).map_err(|source| Error::Parse {
                    path: path.clone(),
                    source,
                })?;
            merged = merge_documents(merged, value, "")?;
        }
        let doc: PipelineDoc = serde_yaml::from_value(merged).map_err(Error::InvalidDocument)?;
        Ok(Self::new(doc))
    }

    pub fn settings(&self) -> &Settings {
        &self.doc.settings
    }

    /// The raw `config` block, prior to include/callable resolution.
    pub fn config_block(&self) -> Option<&serde_json::Value> {
        self.doc.config.as_ref()
    }

    pub fn task(&self, name: &str) -> Result<&TaskConfig, Error> {
        self.doc.tasks.get(name).ok_or_else(|| Error::UnknownTask {
            name: name.to_owned(),
            known: self.doc.tasks.keys().cloned().collect(),
        })
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.doc.tasks.keys().map(String::as_str)
    }

    pub fn graph(&self, name: &str) -> Result<&Graph, Error> {
        self.doc
            .graphs
            .get(name)
            .ok_or_else(|| Error::UnknownGraph {
                name: name.to_owned(),
                known: self.doc.graphs.keys().cloned().collect(),
            })
    }

    /// Names of the dependencies of `task` within `graph`, normalized to a
    /// list regardless of how the YAML spelled them.
    pub fn dependencies(&self, graph: &str, task: &str) -> Result<Vec<String>, Error> {
        let graph = self.graph(graph)?;
        let spec = graph.tasks.get(task).ok_or_else(|| Error::UnknownTask {
            name: task.to_owned(),
            known: graph.tasks.keys().cloned().collect(),
        })?;
        Ok(spec.to_vec())
    }
}

fn merge_documents(
    base: serde_yaml::Value,
    other: serde_yaml::Value,
    path: &str,
) -> Result<serde_yaml::Value, Error> {
    use serde_yaml::Value;
    match (base, other) {
        (Value::Null, other) => Ok(other),
        (base, Value::Null) => Ok(base),
        (Value::Mapping(mut base), Value::Mapping(other)) => {
            for (key, value) in other {
                let key_str = key.as_str().unwrap_or("?").to_owned();
                let child_path = if path.is_empty() {
                    key_str.clone()
                } else {
                    format!("{path}.{key_str}")
                };
                match base.remove(&key) {
                    Some(existing) => {
                        let merged = merge_documents(existing, value, &child_path)?;
                        base.insert(key, merged);
                    }
                    None => {
                        base.insert(key, value);
                    }
                }
            }
            Ok(Value::Mapping(base))
        }
        (base, other) if base == other => Ok(base),
        _ => Err(Error::MergeConflict {
            key: path.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn registry(yaml: &str) -> TaskRegistry {
        TaskRegistry::new(serde_yaml::from_str(yaml).unwrap())
    }

    const SAMPLE: &str = r#"
settings:
  py-tasks-dir: src
  r-tasks-dir: tasks
  flow-type: local
  db: sqlite
tasks:
  raw_numbers:
    py_script: true
    cache_result: true
    iterable_item: number
  summarize:
    py_script: summarize_numbers.py
    args:
      numbers:
        ref: raw_numbers
      precision: 2
  clean:
    r_script: clean/run.R
    outputs:
    - clean/${number}.csv
    map_over: number
graphs:
  sample:
    tasks:
      raw_numbers:
      summarize: raw_numbers
      clean:
      - raw_numbers
      - summarize
"#;

    #[test]
    fn dependency_specs_normalize_to_lists() {
        let registry = registry(SAMPLE);
        assert_eq!(
            registry.dependencies("sample", "raw_numbers").unwrap(),
            Vec::<String>::new()
        );
        assert_eq!(
            registry.dependencies("sample", "summarize").unwrap(),
            vec!["raw_numbers".to_owned()]
        );
        assert_eq!(
            registry.dependencies("sample", "clean").unwrap(),
            vec!["raw_numbers".to_owned(), "summarize".to_owned()]
        );
    }

    #[test]
    fn unknown_names_are_reported_with_known_keys() {
        let registry = registry(SAMPLE);
        let err = registry.task("missing").unwrap_err();
        assert!(matches!(err, Error::UnknownTask { ref known, .. } if known.len() == 3));
        let err = registry.graph("missing").unwrap_err();
        assert!(matches!(err, Error::UnknownGraph { .. }));
        let err = registry.dependencies("sample", "missing").unwrap_err();
        assert!(matches!(err, Error::UnknownTask { .. }));
    }

    #[test]
    fn task_attribute_helpers() {
        let registry = registry(SAMPLE);
        let raw = registry.task("raw_numbers").unwrap();
        assert!(raw.is_python());
        assert!(raw.cache_result());
        assert!(raw.returns_list());
        assert_eq!(raw.py_func_name("raw_numbers"), "raw_numbers");
        assert_eq!(raw.py_file_name("raw_numbers"), "raw_numbers.py");

        let summarize = registry.task("summarize").unwrap();
        assert_eq!(summarize.py_func_name("summarize"), "summarize_numbers");
        assert_eq!(summarize.py_file_name("summarize"), "summarize_numbers.py");

        let clean = registry.task("clean").unwrap();
        assert!(clean.is_rscript());
        assert!(clean.is_mapped());
        assert_eq!(clean.map_keys(), vec!["number"]);
    }

    #[test]
    fn settings_use_kebab_case_keys() {
        let registry = registry(SAMPLE);
        let settings = registry.settings();
        assert_eq!(settings.py_tasks_dir.as_deref(), Some(Utf8Path::new("src")));
        assert_eq!(settings.db, Some(DbKind::Sqlite));
    }

    #[test]
    fn load_many_deep_merges_documents() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("base.yaml");
        let second = dir.path().join("extra.yaml");
        std::fs::write(&first, "tasks:\n  a:\n    py_script: true\n").unwrap();
        std::fs::write(&second, "tasks:\n  b:\n    r_script: b/run.R\n").unwrap();
        let registry = TaskRegistry::load_many(&[
            Utf8PathBuf::try_from(first).unwrap(),
            Utf8PathBuf::try_from(second).unwrap(),
        ])
        .unwrap();
        assert!(registry.task("a").is_ok());
        assert!(registry.task("b").is_ok());
    }

    #[test]
    fn load_many_rejects_conflicting_scalars() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("base.yaml");
        let second = dir.path().join("extra.yaml");
        std::fs::write(&first, "settings:\n  branch: main\n").unwrap();
        std::fs::write(&second, "settings:\n  branch: dev\n").unwrap();
        let err = TaskRegistry::load_many(&[
            Utf8PathBuf::try_from(first).unwrap(),
            Utf8PathBuf::try_from(second).unwrap(),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::MergeConflict { ref key } if key == "settings.branch"));
    }
}
