#![deny(clippy::all)]

//! The task-state cache engine.
//!
//! Given a task name, the engine computes fingerprints of the task's
//! code, inputs, and upstream data, reads the cached state, and decides
//! whether to skip, run, or resume the task. Runs go through the single
//! task executor or, for `map_over` tasks, the fan-out driver; both
//! record start/end state in the state store and finalize with freshly
//! recomputed hashes.

mod cache;
mod deps;
mod ecs;
mod executor;
mod map;

use camino::{Utf8Path, Utf8PathBuf};
pub use cache::{Reason, SubmitOutcome, TaskStateCache};
use kapten_store::TaskStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Registry(#[from] kapten_registry::Error),
    #[error(transparent)]
    Hash(#[from] kapten_hash::Error),
    #[error(transparent)]
    Store(#[from] kapten_store::StoreError),
    #[error(transparent)]
    Runtime(#[from] kapten_runtime::RuntimeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("task '{task}' exited with status {code:?}; see {log}")]
    TaskRun {
        task: String,
        code: Option<i32>,
        log: Utf8PathBuf,
    },
    #[error("task '{task}' wrote a malformed result payload: {source}")]
    ResultDecode {
        task: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("subtask call for '{task}' is missing its 'idx' argument")]
    MissingIndex { task: String },
    #[error("upstream '{dep}' of '{task}' holds non-tuple data for a multi-key map")]
    DataShape { task: String, dep: String },
    #[error("bundle for task '{task}' failed: {errors:?}")]
    Bundle { task: String, errors: Vec<String> },
    #[error("mapped task '{task}' finished {status}")]
    Mapped { task: String, status: TaskStatus },
    #[error("failed to encode task arguments: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Per-flow-run settings handed to the engine at construction time.
/// There is no process-wide singleton; one flow run owns one
/// [`TaskStateCache`] built from one of these.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub pipeline_name: String,
    pub branch: String,
    /// Overrides `branch` as the state-store namespace when set.
    pub storage_key: String,
    pub subset_mode: bool,
    /// Container image tasks deploy with; informational outside prod.
    pub image: String,
    /// Directory prepended to `PYTHONPATH` for task imports.
    pub py_root: Utf8PathBuf,
    /// Dotted module namespace the Python task functions live in.
    pub py_module: String,
    pub r_tasks_dir: Utf8PathBuf,
    /// Parent directory for task output files, per storage key.
    pub scratch_dir: Utf8PathBuf,
    pub python_bin: String,
    pub rscript_bin: String,
    /// Run tasks inline even when the runtime supports deployments.
    pub deploy_inline: bool,
}

impl PipelineOptions {
    pub fn new(pipeline_name: impl Into<String>) -> Self {
        let pipeline_name = pipeline_name.into();
        Self {
            pipeline_name,
            branch: String::new(),
            storage_key: String::new(),
            subset_mode: false,
            image: String::new(),
            py_root: Utf8PathBuf::from("."),
            py_module: String::new(),
            r_tasks_dir: Utf8PathBuf::from("tasks"),
            scratch_dir: Utf8PathBuf::from("scratch"),
            python_bin: "python3".to_owned(),
            rscript_bin: "Rscript".to_owned(),
            deploy_inline: std::env::var("DEPLOY_AS_INLINE_SUBFLOWS").as_deref() == Ok("1"),
        }
    }

    /// The branch-scoped namespace used in the state store partition key.
    pub fn storage_key(&self) -> &str {
        if self.storage_key.is_empty() {
            &self.branch
        } else {
            &self.storage_key
        }
    }

    /// Resolve the scratch root for a storage key: `SCRATCH_DIR` in
    /// containers, the artifact store bucket for s3-backed outputs, a
    /// local `scratch/` directory otherwise.
    pub fn default_scratch_dir(storage_key: &str) -> Utf8PathBuf {
        if let Ok(dir) = std::env::var("SCRATCH_DIR") {
            return Utf8PathBuf::from(dir).join(storage_key);
        }
        if let Ok(bucket) = std::env::var("ARTIFACT_STORE") {
            return Utf8PathBuf::from(format!("s3://{bucket}")).join(storage_key);
        }
        Utf8Path::new("scratch").join(storage_key)
    }

    /// Directory holding the Python task sources:
    /// `py_root` + the module path.
    pub fn py_tasks_dir(&self) -> Utf8PathBuf {
        if self.py_module.is_empty() {
            self.py_root.clone()
        } else {
            self.py_root.join(self.py_module.replace('.', "/"))
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn storage_key_falls_back_to_branch() {
        let mut options = PipelineOptions::new("sample");
        options.branch = "main".to_owned();
        assert_eq!(options.storage_key(), "main");
        options.storage_key = "exp-1".to_owned();
        assert_eq!(options.storage_key(), "exp-1");
    }

    #[test]
    fn py_tasks_dir_joins_the_module_path() {
        let mut options = PipelineOptions::new("sample");
        options.py_root = Utf8PathBuf::from("/code");
        options.py_module = "pipelines.src".to_owned();
        assert_eq!(options.py_tasks_dir(), Utf8PathBuf::from("/code/pipelines/src"));
    }
}
