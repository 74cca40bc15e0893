//! Serde model of the pipeline YAML document.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use serde::Deserialize;

/// Root of a pipeline configuration document.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PipelineDoc {
    pub settings: Settings,
    pub tasks: BTreeMap<String, TaskConfig>,
    pub graphs: BTreeMap<String, Graph>,
    pub config: Option<serde_json::Value>,
}

/// Global runtime settings. Keys are kebab-case in the YAML.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    pub py_tasks_dir: Option<Utf8PathBuf>,
    pub r_tasks_dir: Option<Utf8PathBuf>,
    pub flows_dir: Option<Utf8PathBuf>,
    /// Selects the runtime binding (e.g. "local").
    pub flow_type: Option<String>,
    pub db: Option<DbKind>,
    pub storage_key: Option<String>,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbKind {
    Dynamodb,
    Sqlite,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Graph {
    pub tasks: BTreeMap<String, DependencySpec>,
}

/// A dependency entry may be absent, a single task name, or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DependencySpec {
    Many(Vec<String>),
    One(String),
    Empty(()),
}

impl Default for DependencySpec {
    fn default() -> Self {
        DependencySpec::Empty(())
    }
}

impl DependencySpec {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            DependencySpec::Many(deps) => deps.clone(),
            DependencySpec::One(dep) => vec![dep.clone()],
            DependencySpec::Empty(()) => Vec::new(),
        }
    }
}

/// `py_script` is either a filename or a bare flag marking the task as a
/// Python function named after the task.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ScriptSpec {
    Named(String),
    Enabled(bool),
}

impl ScriptSpec {
    pub fn name(&self) -> Option<&str> {
        match self {
            ScriptSpec::Named(name) => Some(name),
            ScriptSpec::Enabled(_) => None,
        }
    }
}

/// A task argument: a reference to an upstream task's result, or a
/// constant passed through to the task body.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ArgSpec {
    Reference {
        #[serde(rename = "ref")]
        task: String,
    },
    Value(serde_json::Value),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaskWorker {
    pub cpu: serde_json::Value,
    pub memory: serde_json::Value,
}

/// Per-task attributes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Explicit source filename, overriding the `py_script` derivation.
    pub file: Option<String>,
    pub py_script: Option<ScriptSpec>,
    pub r_script: Option<String>,
    pub args: Option<BTreeMap<String, ArgSpec>>,
    pub cli_args: Option<String>,
    pub prefix_args: Option<String>,
    pub outputs: Option<Vec<String>>,
    /// Fan the task out over this key (comma-joined for multi-key maps).
    pub map_over: Option<String>,
    /// Marks the task's result as an iterable consumed by mapped dependents.
    pub iterable_item: Option<String>,
    pub cache_result: Option<bool>,
    pub main_flow: Option<bool>,
    pub bundle_size: Option<usize>,
    pub group_size: Option<usize>,
    pub tags: Option<Vec<String>>,
    pub dask_worker: Option<DaskWorker>,
    pub aws_vars: Option<serde_json::Value>,
    /// Custom log file path, relative to the scratch directory.
    pub logs: Option<String>,
}

impl TaskConfig {
    pub fn is_python(&self) -> bool {
        self.py_script.is_some()
    }

    pub fn is_rscript(&self) -> bool {
        self.r_script.is_some()
    }

    pub fn is_mapped(&self) -> bool {
        self.map_over.is_some()
    }

    pub fn returns_list(&self) -> bool {
        self.iterable_item.is_some()
    }

    pub fn cache_result(&self) -> bool {
        self.cache_result == Some(true)
    }

    pub fn main_flow(&self) -> bool {
        self.main_flow == Some(true)
    }

    /// The individual map keys (a comma-joined `map_over` names several).
    pub fn map_keys(&self) -> Vec<&str> {
        self.map_over
            .as_deref()
            .map(|key| key.split(',').collect())
            .unwrap_or_default()
    }

    /// Name of the Python function backing the task: the `py_script`
    /// filename stem when given, else the task name itself.
    pub fn py_func_name<'a>(&'a self, task_name: &'a str) -> &'a str {
        self.py_script
            .as_ref()
            .and_then(ScriptSpec::name)
            .and_then(|name| name.split('.').next())
            .unwrap_or(task_name)
    }

    /// Filename of the Python source backing the task.
    pub fn py_file_name(&self, task_name: &str) -> String {
        if let Some(file) = &self.file {
            return file.clone();
        }
        match self.py_script.as_ref().and_then(ScriptSpec::name) {
            Some(name) => name.to_owned(),
            None => format!("{task_name}.py"),
        }
    }

    /// `(prefix_args, cli_args)`, empty strings when unset.
    pub fn cli_args(&self) -> (&str, &str) {
        (
            self.prefix_args.as_deref().unwrap_or(""),
            self.cli_args.as_deref().unwrap_or(""),
        )
    }

    pub fn tags(&self) -> &[String] {
        self.tags.as_deref().unwrap_or_default()
    }
}
