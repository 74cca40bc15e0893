//! The decision core: classify a task as skip, run, or resume, and
//! drive the chosen path.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use kapten_hash::{fingerprint_str, serialize_hashes, Hasher};
use kapten_registry::TaskRegistry;
use kapten_runtime::Runtime;
use kapten_store::{StateStore, TaskState, TaskStatus};
use serde_json::json;
use tracing::{debug, info};

use crate::{ecs, executor, map, Error, PipelineOptions};

/// Why a task is being (re-)run. `Display` yields the reason strings
/// surfaced in logs and deployment parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    NoCachedState,
    IgnoreCache,
    SubsetMode,
    PreviousFailure,
    RCodeChanged,
    PyCodeChanged,
    InputsChanged,
    DataChanged,
    Incomplete,
    NotFinished,
}

impl Reason {
    /// Resuming an incomplete mapped task keeps its subtask records.
    pub fn is_resume(&self) -> bool {
        matches!(self, Reason::Incomplete)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Reason::NoCachedState => "No cached state",
            Reason::IgnoreCache => "ignore_cache is set",
            Reason::SubsetMode => "Subset mode",
            Reason::PreviousFailure => "Task previously failed all subtasks",
            Reason::RCodeChanged => "R code changed",
            Reason::PyCodeChanged => "Python code changed",
            Reason::InputsChanged => "Inputs changed",
            Reason::DataChanged => "Data changed",
            Reason::Incomplete => "INCOMPLETE",
            Reason::NotFinished => "Not finished",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Skipped,
    Submitted(Reason),
}

impl SubmitOutcome {
    pub fn reason(&self) -> Option<Reason> {
        match self {
            SubmitOutcome::Skipped => None,
            SubmitOutcome::Submitted(reason) => Some(*reason),
        }
    }
}

/// The per-flow-run cache engine: owns the registry view, the state
/// store client, the hasher, and the runtime binding. Concurrent
/// subtasks in the same worker share one of these.
pub struct TaskStateCache {
    options: PipelineOptions,
    registry: Arc<TaskRegistry>,
    store: Arc<dyn StateStore>,
    hasher: Hasher,
    runtime: Arc<dyn Runtime>,
}

impl TaskStateCache {
    pub fn new(
        options: PipelineOptions,
        registry: Arc<TaskRegistry>,
        store: Arc<dyn StateStore>,
        runtime: Arc<dyn Runtime>,
    ) -> Self {
        let hasher = Hasher::new(
            vec![options.py_tasks_dir()],
            vec![options.r_tasks_dir.clone()],
            options.scratch_dir.clone(),
        );
        Self {
            options,
            registry,
            store,
            hasher,
            runtime,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    pub fn hasher(&self) -> &Hasher {
        &self.hasher
    }

    pub(crate) fn runtime(&self) -> &dyn Runtime {
        self.runtime.as_ref()
    }

    /// Names of the task's dependencies in the current pipeline graph.
    pub fn dep_list(&self, task_name: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .registry
            .dependencies(&self.options.pipeline_name, task_name)?)
    }

    /// Cached states of the task's dependencies, in graph order.
    pub async fn dep_states(
        &self,
        task_name: &str,
    ) -> Result<Vec<(String, Option<TaskState>)>, Error> {
        let mut states = Vec::new();
        for dep in self.dep_list(task_name)? {
            let state = self.fetch_state(&dep).await?;
            states.push((dep, state));
        }
        Ok(states)
    }

    /// The cached state for a task, with data attached.
    pub async fn fetch_state(&self, task_name: &str) -> Result<Option<TaskState>, Error> {
        Ok(self
            .store
            .get_task(task_name, true, self.options.subset_mode)
            .await?)
    }

    pub async fn delete_state(&self, task_name: &str) -> Result<(), Error> {
        Ok(self.store.delete_task(task_name).await?)
    }

    /// Classify the task against its cached state. `None` means the
    /// cache is valid and the task can be skipped.
    pub async fn classify(
        &self,
        task_name: &str,
        ignore_cache: bool,
    ) -> Result<Option<Reason>, Error> {
        let task = self.registry.task(task_name)?;
        let cached = self.fetch_state(task_name).await?;

        let r_code_hashes = if task.is_rscript() {
            Some(serialize_hashes(&self.hasher.hash_r(task_name, task)?)?)
        } else {
            None
        };
        let py_code_hashes = if task.is_python() {
            Some(self.hasher.hash_py(task_name, task)?)
        } else {
            None
        };

        let Some(cached) = cached else {
            return Ok(Some(Reason::NoCachedState));
        };
        if ignore_cache {
            return Ok(Some(Reason::IgnoreCache));
        }
        if self.options.subset_mode {
            return Ok(Some(Reason::SubsetMode));
        }
        if cached.status == Some(TaskStatus::Failure) {
            return Ok(Some(Reason::PreviousFailure));
        }
        if task.is_rscript() {
            let local_version = r_code_hashes.as_deref().map(fingerprint_str);
            if local_version != cached.r_code_version() {
                info!(
                    "R code changed for {task_name}: {local_version:?} != {:?}",
                    cached.r_code_version()
                );
                return Ok(Some(Reason::RCodeChanged));
            }
        }
        let local_py_version = py_code_hashes.as_deref().map(fingerprint_str);
        if local_py_version != cached.py_code_version() {
            return Ok(Some(Reason::PyCodeChanged));
        }

        let dep_states = self.dep_states(task_name).await?;
        let inputs = self.serialized_input_hashes(task_name, &dep_states)?;
        if inputs.as_deref().map(fingerprint_str) != cached.inputs_version() {
            return Ok(Some(Reason::InputsChanged));
        }
        let data = self.serialized_data_hashes(task_name, &dep_states)?;
        if data.as_deref().map(fingerprint_str) != cached.input_data_version() {
            return Ok(Some(Reason::DataChanged));
        }
        // The reasons above wipe the cache and re-run; the two below
        // re-submit the task to fill out the existing cache.
        if cached.status == Some(TaskStatus::Incomplete) {
            return Ok(Some(Reason::Incomplete));
        }
        if cached.end_time.is_none() {
            return Ok(Some(Reason::NotFinished));
        }
        Ok(None)
    }

    /// Submit the task if its cached state is out of date.
    pub async fn submit(
        &self,
        task_name: &str,
        parameters: serde_json::Map<String, serde_json::Value>,
        ignore_cache: bool,
    ) -> Result<SubmitOutcome, Error> {
        debug!("submit({task_name}, ignore_cache={ignore_cache}) called");
        match self.classify(task_name, ignore_cache).await? {
            Some(reason) => {
                info!("Submitting task {task_name} because {reason}");
                self.launch(task_name, reason, parameters).await?;
                Ok(SubmitOutcome::Submitted(reason))
            }
            None => {
                info!("Skipping task {task_name}");
                Ok(SubmitOutcome::Skipped)
            }
        }
    }

    /// Hand the run to the runtime binding: a separate deployment when
    /// supported, an inline run otherwise.
    async fn launch(
        &self,
        task_name: &str,
        reason: Reason,
        parameters: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), Error> {
        if self.runtime.supports_deployments() && !self.options.deploy_inline {
            let task = self.registry.task(task_name)?;
            let deployment = format!(
                "run-task/{}-RunTask-{}",
                self.options.pipeline_name,
                self.options.storage_key()
            );
            info!("Running deployment for '{task_name}'");
            let mut job_variables = task
                .aws_vars
                .clone()
                .unwrap_or_else(|| json!({}));
            if let (Some(vars), Some(worker)) = (job_variables.as_object_mut(), &task.dask_worker)
            {
                vars.insert("worker_cpu".to_owned(), worker.cpu.clone());
                vars.insert("worker_mem".to_owned(), worker.memory.clone());
            }
            self.runtime
                .run_deployment(
                    &deployment,
                    json!({
                        "pipeline": self.options.pipeline_name,
                        "task_name": task_name,
                        "reason": reason.to_string(),
                        "parameters": parameters,
                    }),
                    job_variables,
                )
                .await?;
            Ok(())
        } else {
            self.run_task(task_name, reason, parameters).await
        }
    }

    /// Run a task in the current process: pre-run hygiene, execution,
    /// and finalization. Deployment containers land here too.
    pub async fn run_task(
        &self,
        task_name: &str,
        reason: Reason,
        parameters: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), Error> {
        let task = self.registry.task(task_name)?.clone();

        // Pre-run hygiene: a fresh run must not inherit fingerprints
        // from an earlier one. Resumes and subset runs keep theirs.
        if self.options.subset_mode {
            if task.is_python() {
                info!("Clearing subset before running task {task_name}");
                self.store.delete_subset_data(task_name).await?;
            }
        } else if reason.is_resume() && task.is_mapped() {
            // The map driver needs the existing subtask records.
        } else {
            info!("Clearing cache before running task {task_name}");
            self.store.delete_task(task_name).await?;
        }

        if task.is_mapped() {
            info!("Running mapped task {task_name}");
            match map::run_mapped_task(self, task_name).await {
                Ok(TaskStatus::Success) => {}
                Ok(status) => {
                    // Keep the recomputed hashes so a later code change
                    // still invalidates the partial state.
                    if !self.options.subset_mode {
                        self.set_final_state(task_name, None).await?;
                    }
                    return Err(Error::Mapped {
                        task: task_name.to_owned(),
                        status,
                    });
                }
                Err(err) => {
                    if !self.options.subset_mode {
                        self.set_final_state(task_name, None).await?;
                    }
                    return Err(err);
                }
            }
        } else {
            executor::run_single_task(self, task_name, parameters).await?;
        }

        if self.options.subset_mode {
            // The side channel was written by the executor; the full-run
            // record stays untouched.
            return Ok(());
        }
        self.set_final_state(task_name, Some(TaskStatus::Success)).await
    }

    /// Write the initial record for a task about to execute. In subset
    /// mode an existing record is left alone.
    pub(crate) async fn set_initial_state(&self, task_name: &str) -> Result<TaskState, Error> {
        let ecs_task_id = ecs::fetch_task_id().await;
        let initial = TaskState {
            ecs_task_id: Some(ecs_task_id),
            start_time: Some(kapten_store::now_iso()),
            ..Default::default()
        };
        if self.options.subset_mode {
            if self.store.get_task(task_name, false, false).await?.is_none() {
                self.store.create_task(task_name, &initial, None).await?;
            }
        } else {
            self.store.create_task(task_name, &initial, None).await?;
        }
        Ok(initial)
    }

    /// Finalize a task: recompute input, data, output, and code hashes
    /// and merge them into the record. Hashes are recomputed rather than
    /// inherited because finalization may run in a different process
    /// than the submit that triggered it.
    pub(crate) async fn set_final_state(
        &self,
        task_name: &str,
        status: Option<TaskStatus>,
    ) -> Result<(), Error> {
        let task = self.registry.task(task_name)?;
        let dep_states = self.dep_states(task_name).await?;
        let input_hashes = self.serialized_input_hashes(task_name, &dep_states)?;
        let input_data_hashes = self.serialized_data_hashes(task_name, &dep_states)?;

        // Mapped tasks carry the composite of their subtask output
        // hashes, already written by the map driver.
        let outputs_version = if task.is_mapped() {
            None
        } else {
            self.hasher
                .hash_task_outputs(task)?
                .filter(|hash| !hash.is_empty())
        };

        let r_code_hashes = if task.is_rscript() {
            Some(serialize_hashes(&self.hasher.hash_r(task_name, task)?)?)
        } else {
            None
        };
        let py_code_hashes = if task.is_python() {
            Some(self.hasher.hash_py(task_name, task)?)
        } else {
            None
        };

        let patch = TaskState {
            r_code_hashes,
            py_code_hashes,
            outputs_version,
            input_hashes,
            input_data_hashes,
            status,
            updated_at: Some(kapten_store::now_iso()),
            ..Default::default()
        };
        // output_data_version was already recorded by set_task_ended.
        Ok(self.store.update_task(task_name, &patch).await?)
    }

    /// Serialized `{dep → outputs_version}` tree; `None` when no
    /// dependency has published outputs (missing is not a mismatch).
    fn serialized_input_hashes(
        &self,
        task_name: &str,
        dep_states: &[(String, Option<TaskState>)],
    ) -> Result<Option<String>, Error> {
        let tree: BTreeMap<&str, String> = dep_states
            .iter()
            .filter_map(|(dep, state)| {
                state
                    .as_ref()
                    .and_then(|state| state.outputs_version.clone())
                    .map(|version| (dep.as_str(), version))
            })
            .collect();
        debug!("{task_name} inputs_version_tree: {tree:?}");
        if tree.is_empty() {
            return Ok(None);
        }
        Ok(Some(serialize_hashes(&tree)?))
    }

    /// Serialized `{dep → output_data_version}` tree.
    fn serialized_data_hashes(
        &self,
        task_name: &str,
        dep_states: &[(String, Option<TaskState>)],
    ) -> Result<Option<String>, Error> {
        let tree: BTreeMap<&str, String> = dep_states
            .iter()
            .filter_map(|(dep, state)| {
                state
                    .as_ref()
                    .and_then(|state| state.output_data_version.clone())
                    .map(|version| (dep.as_str(), version))
            })
            .collect();
        debug!("task={task_name} data_version_tree={tree:?}");
        if tree.is_empty() {
            return Ok(None);
        }
        Ok(Some(serialize_hashes(&tree)?))
    }
}
