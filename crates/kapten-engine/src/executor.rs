//! Execution of a single task invocation: a Python function behind the
//! configured interpreter, or an R script behind `Rscript`.
//!
//! The same entry points serve plain tasks and individual subtasks of a
//! mapped parent; the presence of the map-over key in the supplied
//! arguments tells them apart.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use kapten_registry::{ArgSpec, TaskConfig};
use kapten_store::{StateStore, TaskOutcome};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::deps::{self, scalar_string};
use crate::{Error, TaskStateCache};

/// Bridge executed by the Python interpreter: resolves the task function
/// inside the configured module namespace, feeds it the keyword
/// arguments from stdin, and hands the JSON result back through a file.
const PY_RUNNER: &str = r#"
import importlib
import json
import os
import sys

kwargs = json.load(sys.stdin)
module = importlib.import_module(os.environ["KAPTEN_PY_MODULE"])
func = getattr(module, os.environ["KAPTEN_PY_FUNC"])
result = func(**kwargs)
with open(os.environ["KAPTEN_RESULT_PATH"], "w") as handle:
    json.dump(result, handle)
"#;

/// Execute either an R script or a Python function, with upstream data
/// resolved into the call arguments.
pub(crate) async fn run_single_task(
    cache: &TaskStateCache,
    task_name: &str,
    parameters: serde_json::Map<String, Value>,
) -> Result<(), Error> {
    let resolved = deps::fetch_cached_dep_data(cache, task_name).await?;
    let mut kwargs = resolved.args;
    kwargs.extend(parameters);
    if cache.registry().task(task_name)?.is_rscript() {
        rscript_task(cache, task_name, kwargs).await
    } else {
        py_task(cache, task_name, kwargs).await
    }
}

/// Call a task's R script. Serves single tasks and mapped subtasks.
pub(crate) async fn rscript_task(
    cache: &TaskStateCache,
    task_name: &str,
    mut kwargs: BTreeMap<String, Value>,
) -> Result<(), Error> {
    let task = cache.registry().task(task_name)?.clone();
    let key = key_value(&task, &kwargs);
    let index = take_index(&mut kwargs);

    if key.is_some() {
        let index = index.ok_or_else(|| Error::MissingIndex {
            task: task_name.to_owned(),
        })?;
        cache.store().set_subtask_started(task_name, index).await?;
    } else {
        cache.set_initial_state(task_name).await?;
    }

    let env: BTreeMap<String, String> = kwargs
        .iter()
        .map(|(name, value)| (name.clone(), scalar_string(value)))
        .collect();
    let script = task
        .r_script
        .clone()
        .unwrap_or_else(|| format!("{task_name}/run.R"));
    let script_path = cache.hasher().resolve_r_script(&script, &env)?;
    let (prefix_args, cli_args) = task.cli_args();
    info!("Calling R script {script_path} with env {env:?}");

    let mut tokens: Vec<String> = prefix_args.split_whitespace().map(str::to_owned).collect();
    tokens.push(cache.options().rscript_bin.clone());
    tokens.push(script_path.to_string());
    tokens.extend(cli_args.split_whitespace().map(str::to_owned));

    let mut command = Command::new(&tokens[0]);
    command.args(&tokens[1..]);
    for (name, value) in &env {
        command.env(name, value);
    }
    command.env("KAPTEN_SCRATCH_DIR", cache.options().scratch_dir.as_str());

    let log_path = log_file_path(cache, &task, task_name, key.as_deref());
    run_command(task_name, command, &log_path, None).await?;

    if let Some(index) = index.filter(|_| key.is_some()) {
        let started = Instant::now();
        let output_hash = cache.hasher().hash_subtask_outputs(&task, &env)?;
        debug!("Hashing output files took {:?}", started.elapsed());
        cache
            .store()
            .set_subtask_ended(
                task_name,
                index,
                output_hash.as_deref().filter(|hash| !hash.is_empty()),
            )
            .await?;
    } else {
        cache
            .store()
            .set_task_ended(task_name, &TaskOutcome::default())
            .await?;
    }
    Ok(())
}

/// Call a task's Python function through the interpreter shim. Serves
/// single tasks and mapped subtasks.
pub(crate) async fn py_task(
    cache: &TaskStateCache,
    task_name: &str,
    mut kwargs: BTreeMap<String, Value>,
) -> Result<(), Error> {
    let task = cache.registry().task(task_name)?.clone();
    let key = key_value(&task, &kwargs);
    let index = take_index(&mut kwargs);

    if key.is_some() {
        let index = index.ok_or_else(|| Error::MissingIndex {
            task: task_name.to_owned(),
        })?;
        cache.store().set_subtask_started(task_name, index).await?;
    } else {
        cache.set_initial_state(task_name).await?;
    }

    // Constant args from the config fill in whatever the dependency data
    // did not already provide.
    if let Some(args) = &task.args {
        for (name, spec) in args {
            if let ArgSpec::Value(value) = spec {
                kwargs.entry(name.clone()).or_insert_with(|| value.clone());
            }
        }
    }

    let options = cache.options();
    let result_file = tempfile::NamedTempFile::new()?;
    let mut command = Command::new(&options.python_bin);
    command
        .arg("-c")
        .arg(PY_RUNNER)
        .env("KAPTEN_PY_MODULE", &options.py_module)
        .env("KAPTEN_PY_FUNC", task.py_func_name(task_name))
        .env("KAPTEN_RESULT_PATH", result_file.path())
        .env("KAPTEN_SCRATCH_DIR", options.scratch_dir.as_str())
        .env("PYTHONPATH", python_path(&options.py_root));

    let payload = serde_json::to_vec(&kwargs).map_err(Error::Encode)?;
    let log_path = log_file_path(cache, &task, task_name, key.as_deref());
    run_command(task_name, command, &log_path, Some(payload)).await?;

    let raw = std::fs::read_to_string(result_file.path())?;
    let result: Value = serde_json::from_str(&raw).map_err(|source| Error::ResultDecode {
        task: task_name.to_owned(),
        source,
    })?;
    let result = (result != Value::Null).then_some(result);

    if let Some(index) = index.filter(|_| key.is_some()) {
        cache.store().set_subtask_ended(task_name, index, None).await?;
    } else {
        let outcome = TaskOutcome {
            result_hash: result.as_ref().map(kapten_hash::fingerprint),
            result,
            subset_mode: options.subset_mode,
            ..Default::default()
        };
        cache.store().set_task_ended(task_name, &outcome).await?;
    }
    Ok(())
}

/// The subtask key for this invocation: the comma-join of the map-over
/// key values, when they are all present in the arguments.
pub(crate) fn key_value(task: &TaskConfig, kwargs: &BTreeMap<String, Value>) -> Option<String> {
    let keys = task.map_keys();
    if keys.is_empty() || !keys.iter().all(|key| kwargs.contains_key(*key)) {
        return None;
    }
    Some(
        keys.iter()
            .map(|key| kwargs.get(*key).map(scalar_string).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(","),
    )
}

/// Pop the subtask index injected by the map driver.
pub(crate) fn take_index(kwargs: &mut BTreeMap<String, Value>) -> Option<usize> {
    kwargs
        .remove("idx")
        .and_then(|value| value.as_u64())
        .map(|value| value as usize)
}

fn python_path(py_root: &Utf8Path) -> String {
    match std::env::var("PYTHONPATH") {
        Ok(existing) if !existing.is_empty() => format!("{py_root}:{existing}"),
        _ => py_root.to_string(),
    }
}

/// Task- or subtask-scoped log file under the scratch root, honoring a
/// custom `logs` path from the task config.
fn log_file_path(
    cache: &TaskStateCache,
    task: &TaskConfig,
    task_name: &str,
    key: Option<&str>,
) -> Utf8PathBuf {
    let dir = match &task.logs {
        Some(custom) => cache.options().scratch_dir.join(custom),
        None => cache.options().scratch_dir.join("logs"),
    };
    let file_name = match key {
        Some(key) => format!("{task_name}-{}.log", sanitize(key)),
        None => format!("{task_name}.log"),
    };
    dir.join(file_name)
}

fn sanitize(key: &str) -> String {
    key.replace(['/', '\\', ','], "_")
}

/// Spawn the task body, stream its stdout and stderr into the log file,
/// and fail with the exit status on a non-zero exit.
async fn run_command(
    task_name: &str,
    mut command: Command,
    log_path: &Utf8Path,
    stdin: Option<Vec<u8>>,
) -> Result<(), Error> {
    if let Some(parent) = log_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    if stdin.is_some() {
        command.stdin(Stdio::piped());
    }
    let mut child = command.spawn()?;

    if let Some(payload) = stdin {
        if let Some(mut handle) = child.stdin.take() {
            handle.write_all(&payload).await?;
        }
    }

    let mut stdout = child.stdout.take().ok_or_else(pipe_error)?;
    let mut stderr = child.stderr.take().ok_or_else(pipe_error)?;
    let mut log = tokio::fs::File::create(log_path).await?;
    let mut log_err = log.try_clone().await?;
    let (copied_out, copied_err, status) = tokio::join!(
        tokio::io::copy(&mut stdout, &mut log),
        tokio::io::copy(&mut stderr, &mut log_err),
        child.wait(),
    );
    copied_out?;
    copied_err?;
    let status = status?;

    if !status.success() {
        return Err(Error::TaskRun {
            task: task_name.to_owned(),
            code: status.code(),
            log: log_path.to_owned(),
        });
    }
    debug!("task {task_name} body finished, logs at {log_path}");
    Ok(())
}

fn pipe_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, "child process pipe not captured")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn task(yaml: &str) -> TaskConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn key_value_joins_multi_key_maps() {
        let task = task("map_over: \"state,year\"");
        let kwargs = BTreeMap::from([
            ("state".to_owned(), json!("ca")),
            ("year".to_owned(), json!(2022)),
        ]);
        assert_eq!(key_value(&task, &kwargs), Some("ca,2022".to_owned()));
    }

    #[test]
    fn key_value_requires_every_key() {
        let task = task("map_over: \"state,year\"");
        let kwargs = BTreeMap::from([("state".to_owned(), json!("ca"))]);
        assert_eq!(key_value(&task, &kwargs), None);
    }

    #[test]
    fn unmapped_tasks_have_no_key() {
        let task = task("py_script: true");
        let kwargs = BTreeMap::from([("state".to_owned(), json!("ca"))]);
        assert_eq!(key_value(&task, &kwargs), None);
    }

    #[test]
    fn take_index_pops_the_idx_argument() {
        let mut kwargs = BTreeMap::from([
            ("idx".to_owned(), json!(7)),
            ("state".to_owned(), json!("ca")),
        ]);
        assert_eq!(take_index(&mut kwargs), Some(7));
        assert!(!kwargs.contains_key("idx"));
        assert_eq!(take_index(&mut kwargs), None);
    }

    #[test]
    fn log_names_are_subtask_scoped() {
        assert_eq!(sanitize("ca,2022"), "ca_2022");
        assert_eq!(sanitize("a/b"), "a_b");
    }
}
