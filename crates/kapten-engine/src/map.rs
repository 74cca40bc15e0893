//! Fan-out driver for `map_over` tasks.
//!
//! Builds one subtask per value, dispatches them through the runtime
//! binding in bounded batches, rolls the per-call results up into a
//! composite status, and derives the composite output fingerprint from
//! the ordered subtask output hashes.

use std::collections::BTreeMap;
use std::time::Instant;

use kapten_runtime::{MapArg, RunFailure, Runtime, TaskCall};
use kapten_store::{StateStore, TaskOutcome, TaskStatus};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::deps::{self, scalar_string};
use crate::{executor, Error, TaskStateCache};

pub(crate) async fn run_mapped_task(
    cache: &TaskStateCache,
    task_name: &str,
) -> Result<TaskStatus, Error> {
    let task = cache.registry().task(task_name)?.clone();
    let resolved = deps::fetch_cached_dep_data(cache, task_name).await?;
    cache.set_initial_state(task_name).await?;

    let mut vectors: BTreeMap<String, MapArg> = BTreeMap::new();
    for (name, value) in resolved.args {
        let arg = match value {
            Value::Array(items) => MapArg::Each(items),
            scalar => kapten_runtime::unmapped(scalar),
        };
        vectors.insert(name, arg);
    }
    let keys: Vec<String> = resolved.value_list.iter().map(scalar_string).collect();
    let mut indices: Vec<usize> = (0..keys.len()).collect();

    if cache.options().subset_mode {
        // Only the requested subset runs; the full-run subtask records
        // are not recreated.
        cache
            .store()
            .reset_subset_of_subtasks(task_name, &keys)
            .await?;
    } else {
        let subtasks = cache.store().get_subtasks(task_name).await?;
        if !subtasks.is_empty() {
            // Resume: reduce the dispatch set to the unfinished subtasks
            // and reconstitute their keys into per-argument vectors.
            let unfinished: Vec<_> = subtasks.iter().filter(|s| !s.is_finished()).collect();
            info!(
                "Subtasks found for {task_name}; incomplete subtasks: {}",
                unfinished.len()
            );
            indices = unfinished.iter().map(|subtask| subtask.i).collect();

            let map_keys = task.map_keys();
            for (name, arg) in vectors.iter_mut() {
                if map_keys.contains(&name.as_str()) {
                    continue;
                }
                if let MapArg::Each(items) = arg {
                    *items = indices
                        .iter()
                        .map(|i| items.get(*i).cloned().unwrap_or(Value::Null))
                        .collect();
                }
            }
            if map_keys.len() > 1 {
                for (position, key_name) in map_keys.iter().enumerate() {
                    let column = unfinished
                        .iter()
                        .map(|subtask| {
                            Value::String(
                                subtask
                                    .key
                                    .split(',')
                                    .nth(position)
                                    .unwrap_or_default()
                                    .to_owned(),
                            )
                        })
                        .collect();
                    vectors.insert((*key_name).to_owned(), MapArg::Each(column));
                }
            } else if let Some(key_name) = map_keys.first() {
                let column = unfinished
                    .iter()
                    .map(|subtask| Value::String(subtask.key.clone()))
                    .collect();
                vectors.insert((*key_name).to_owned(), MapArg::Each(column));
            }
        } else {
            info!("Creating fresh subtasks for {task_name}");
            cache.store().create_subtasks(task_name, &keys).await?;
        }
    }

    // One kwargs map per dispatched subtask, idx included.
    let call_specs: Vec<BTreeMap<String, Value>> = indices
        .iter()
        .enumerate()
        .map(|(position, index)| {
            let mut kwargs = BTreeMap::new();
            for (name, arg) in &vectors {
                if let Some(value) = arg.value_at(position) {
                    kwargs.insert(name.clone(), value.clone());
                }
            }
            kwargs.insert("idx".to_owned(), json!(index));
            kwargs
        })
        .collect();

    // A bundle is a batch of subtasks one worker iterates sequentially,
    // amortizing scheduler overhead for many cheap subtasks.
    let units: Vec<Vec<BTreeMap<String, Value>>> = match task.bundle_size {
        Some(size) if size > 0 => call_specs.chunks(size).map(<[_]>::to_vec).collect(),
        _ => call_specs.into_iter().map(|spec| vec![spec]).collect(),
    };

    let is_rscript = task.is_rscript();
    let tags = task.tags().to_vec();
    debug!(
        "Mapping task {task_name} across {} dispatch units",
        units.len()
    );

    let overall = match task.group_size {
        // Dispatch in waves to bound concurrent resource pressure.
        Some(size) if size > 0 => {
            let mut wave_statuses = Vec::new();
            for wave in units.chunks(size) {
                let calls: Vec<TaskCall<'_>> = wave
                    .iter()
                    .cloned()
                    .map(|bundle| unit_call(cache, task_name, is_rscript, bundle))
                    .collect();
                let results = cache.runtime().map(&tags, calls).await;
                wave_statuses.push(rollup_results(&results));
            }
            rollup_statuses(&wave_statuses)
        }
        _ => {
            let calls: Vec<TaskCall<'_>> = units
                .into_iter()
                .map(|bundle| unit_call(cache, task_name, is_rscript, bundle))
                .collect();
            let results = cache.runtime().map(&tags, calls).await;
            rollup_results(&results)
        }
    };

    if cache.options().subset_mode {
        // Subset runs never touch the full-run terminal fields.
        debug!("subset run of {task_name} rolled up {overall}; full-run cache untouched");
        return Ok(overall);
    }

    match overall {
        TaskStatus::Success => {
            let outputs_version = composite_outputs_version(cache, task_name).await?;
            cache
                .store()
                .set_task_ended(
                    task_name,
                    &TaskOutcome {
                        status: Some(TaskStatus::Success),
                        outputs_version,
                        ..Default::default()
                    },
                )
                .await?;
        }
        status => {
            cache
                .store()
                .set_task_ended(
                    task_name,
                    &TaskOutcome {
                        status: Some(status),
                        ..Default::default()
                    },
                )
                .await?;
        }
    }
    Ok(overall)
}

/// One dispatched unit: a single subtask call, or a bundle iterated
/// sequentially with per-element errors aggregated at the boundary.
fn unit_call<'a>(
    cache: &'a TaskStateCache,
    task_name: &'a str,
    is_rscript: bool,
    bundle: Vec<BTreeMap<String, Value>>,
) -> TaskCall<'a> {
    Box::pin(async move {
        let mut errors = Vec::new();
        for kwargs in bundle {
            let result = if is_rscript {
                executor::rscript_task(cache, task_name, kwargs).await
            } else {
                executor::py_task(cache, task_name, kwargs).await
            };
            if let Err(err) = result {
                errors.push(err.to_string());
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RunFailure::new(
                Error::Bundle {
                    task: task_name.to_owned(),
                    errors,
                }
                .to_string(),
            ))
        }
    })
}

/// Composite fingerprint of the ordered subtask output hashes.
/// Reordering subtasks changes the composite by design of the wire
/// contract.
async fn composite_outputs_version(
    cache: &TaskStateCache,
    task_name: &str,
) -> Result<Option<String>, Error> {
    let mut subtasks = cache.store().get_subtasks(task_name).await?;
    if subtasks.is_empty() {
        return Ok(None);
    }
    subtasks.sort_by_key(|subtask| subtask.i);
    let hashes: Vec<Value> = subtasks
        .iter()
        .map(|subtask| match &subtask.output_hash {
            Some(hash) => Value::String(hash.clone()),
            None => Value::Null,
        })
        .collect();
    let started = Instant::now();
    let version = kapten_hash::fingerprint(&Value::Array(hashes));
    debug!("Composite hash took {:?}", started.elapsed());
    Ok(Some(version))
}

pub(crate) fn rollup_results(results: &[Result<(), RunFailure>]) -> TaskStatus {
    rollup(results.len(), results.iter().filter(|r| r.is_ok()).count())
}

pub(crate) fn rollup_statuses(statuses: &[TaskStatus]) -> TaskStatus {
    rollup(
        statuses.len(),
        statuses
            .iter()
            .filter(|status| **status == TaskStatus::Success)
            .count(),
    )
}

fn rollup(total: usize, succeeded: usize) -> TaskStatus {
    if succeeded == total {
        TaskStatus::Success
    } else if succeeded == 0 {
        TaskStatus::Failure
    } else {
        TaskStatus::Incomplete
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    #[test_case(3, 3, TaskStatus::Success; "all succeeded")]
    #[test_case(3, 0, TaskStatus::Failure; "none succeeded")]
    #[test_case(3, 2, TaskStatus::Incomplete; "mixed")]
    #[test_case(0, 0, TaskStatus::Success; "empty dispatch")]
    fn rollup_matches_the_success_count(total: usize, succeeded: usize, expected: TaskStatus) {
        assert_eq!(rollup(total, succeeded), expected);
    }

    #[test]
    fn wave_statuses_roll_up_like_results() {
        let statuses = [TaskStatus::Success, TaskStatus::Incomplete];
        assert_eq!(rollup_statuses(&statuses), TaskStatus::Incomplete);
        let statuses = [TaskStatus::Failure, TaskStatus::Failure];
        assert_eq!(rollup_statuses(&statuses), TaskStatus::Failure);
    }
}
