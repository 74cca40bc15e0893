//! Resolution of upstream data into a task's call arguments.

use std::collections::BTreeMap;

use kapten_registry::ArgSpec;
use serde_json::Value;
use tracing::debug;

use crate::{Error, TaskStateCache};

/// Upstream data reshaped for a downstream task.
///
/// `args` maps argument names to values (whole lists for mapped
/// consumers). `value_list` is the list of map-key values, used by the
/// fan-out driver to create subtasks; for a comma-joined multi-key map
/// it holds the joined strings.
#[derive(Debug, Default)]
pub(crate) struct DepData {
    pub args: BTreeMap<String, Value>,
    pub value_list: Vec<Value>,
}

/// Read the cached `data` of each dependency with `cache_result: true`
/// and re-shape it per the downstream task's argument aliases.
pub(crate) async fn fetch_cached_dep_data(
    cache: &TaskStateCache,
    task_name: &str,
) -> Result<DepData, Error> {
    let registry = cache.registry();
    let task = registry.task(task_name)?;

    // Map upstream task names to the argument aliases that reference them.
    let mut arg_lookup: BTreeMap<&str, &str> = BTreeMap::new();
    if let Some(args) = &task.args {
        for (arg_name, spec) in args {
            if let ArgSpec::Reference { task: upstream } = spec {
                arg_lookup.insert(upstream.as_str(), arg_name.as_str());
            }
        }
    }

    let mut resolved = DepData::default();
    for dep_name in cache.dep_list(task_name)? {
        let dep = registry.task(&dep_name)?;
        if !dep.cache_result() {
            continue;
        }
        let Some(state) = cache.fetch_state(&dep_name).await? else {
            continue;
        };
        let Some(data) = state.data else {
            continue;
        };
        if data == Value::String(String::new()) {
            continue;
        }

        // Alias precedence: a mapped consumer takes the upstream's
        // iterable_item name, then any explicit {ref:} alias, then the
        // dependency name itself.
        let key = if task.is_mapped() && dep.iterable_item.is_some() {
            dep.iterable_item.clone().unwrap_or_default()
        } else if let Some(alias) = arg_lookup.get(dep_name.as_str()) {
            (*alias).to_owned()
        } else {
            dep_name.clone()
        };

        if task.is_mapped() && key.contains(',') {
            // Tuple-list upstream data is transposed into parallel
            // per-key vectors; the joined strings become the map keys.
            let rows = data.as_array().ok_or_else(|| Error::DataShape {
                task: task_name.to_owned(),
                dep: dep_name.clone(),
            })?;
            for (position, part) in key.split(',').enumerate() {
                let column: Vec<Value> = rows
                    .iter()
                    .map(|row| {
                        row.as_array()
                            .and_then(|tuple| tuple.get(position))
                            .cloned()
                            .ok_or_else(|| Error::DataShape {
                                task: task_name.to_owned(),
                                dep: dep_name.clone(),
                            })
                    })
                    .collect::<Result<_, _>>()?;
                resolved.args.insert(part.to_owned(), Value::Array(column));
            }
            resolved.value_list = rows
                .iter()
                .map(|row| {
                    row.as_array()
                        .map(|tuple| Value::String(join_values(tuple)))
                        .ok_or_else(|| Error::DataShape {
                            task: task_name.to_owned(),
                            dep: dep_name.clone(),
                        })
                })
                .collect::<Result<_, _>>()?;
        } else {
            resolved.value_list = match &data {
                Value::Array(items) => items.clone(),
                scalar => vec![scalar.clone()],
            };
            resolved.args.insert(key, data);
        }
    }
    debug!(
        "resolved dep data for {task_name}: args={:?} values={}",
        resolved.args.keys().collect::<Vec<_>>(),
        resolved.value_list.len()
    );
    Ok(resolved)
}

/// A scalar rendered the way it appears in subtask keys and environment
/// variables: strings verbatim, everything else as compact JSON.
pub(crate) fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Comma-join of a tuple's values, e.g. `("ca", 2022)` → `"ca,2022"`.
pub(crate) fn join_values(values: &[Value]) -> String {
    values
        .iter()
        .map(scalar_string)
        .collect::<Vec<_>>()
        .join(",")
}
