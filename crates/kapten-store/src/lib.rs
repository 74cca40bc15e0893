#![deny(clippy::all)]

//! Persistence of task records, subtask records, and opaque task-data
//! blobs keyed by (branch, pipeline, task).
//!
//! Two back-ends implement [`StateStore`]: a DynamoDB client with
//! size-bounded items (payloads split into bins of [`BIN_SIZE`] items)
//! and an embedded SQLite store for local runs. Back-end failures
//! surface as [`StoreError`]; the core performs no retries — those
//! belong to the runtime binding.

mod dynamodb;
mod key;
mod models;
mod sqlite;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
pub use dynamodb::DynamoDbStore;
pub use key::StoreKey;
pub use models::{BinKind, Subtask, TaskOutcome, TaskState, TaskStatus, BIN_SIZE};
pub use sqlite::SqliteStore;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("failed to decode stored payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("subtask index {index} not present for task '{task}'")]
    SubtaskIndex { task: String, index: usize },
}

/// Current time as a stored timestamp (RFC 3339, microseconds).
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Abstract persistence of task state. All operations are idempotent
/// per field; readers may observe non-atomic interleavings of subtask
/// finalization.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Overwrite the task record; split `data` into bins if provided
    /// (data riding on `state` itself is also honored).
    async fn create_task(
        &self,
        task: &str,
        state: &TaskState,
        data: Option<&serde_json::Value>,
    ) -> Result<(), StoreError>;

    /// Merge non-null fields of `patch` into the existing record.
    async fn update_task(&self, task: &str, patch: &TaskState) -> Result<(), StoreError>;

    /// Fetch the record and, if requested, its concatenated data bins.
    /// In subset mode the `SUBSETBIN` side channel is preferred, falling
    /// back to `TASKDATABIN`.
    async fn get_task(
        &self,
        task: &str,
        include_data: bool,
        subset_mode: bool,
    ) -> Result<Option<TaskState>, StoreError>;

    /// The decoded list or scalar across data bins.
    async fn get_taskdata(
        &self,
        task: &str,
        subset_mode: bool,
    ) -> Result<Option<serde_json::Value>, StoreError>;

    /// Write subtask bins; indices are contiguous from 0.
    async fn create_subtasks(&self, task: &str, keys: &[String]) -> Result<(), StoreError>;

    async fn get_subtasks(&self, task: &str) -> Result<Vec<Subtask>, StoreError>;

    /// Stamp `startTime` on one subtask, inside bin `index / BIN_SIZE`.
    async fn set_subtask_started(&self, task: &str, index: usize) -> Result<(), StoreError>;

    /// Stamp `endTime` (and the output hash) on one subtask.
    async fn set_subtask_ended(
        &self,
        task: &str,
        index: usize,
        output_hash: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Finalizer. In subset mode with a result, writes the result to
    /// `SUBSETBIN` and touches only the timestamp; otherwise writes the
    /// terminal fields and any result bins.
    async fn set_task_ended(&self, task: &str, outcome: &TaskOutcome) -> Result<(), StoreError>;

    /// Clear start/end marks on the named subtasks ahead of a subset
    /// re-run. Back-ends may implement this as a no-op.
    async fn reset_subset_of_subtasks(
        &self,
        task: &str,
        subset: &[String],
    ) -> Result<(), StoreError>;

    /// Drop the `SUBSETBIN` side channel.
    async fn delete_subset_data(&self, task: &str) -> Result<(), StoreError>;

    /// Delete all bins (subtask, data, subset), then the task record.
    async fn delete_task(&self, task: &str) -> Result<(), StoreError>;
}

/// Split a result payload into `(bin_id, json)` chunks: lists cascade
/// into bins of [`BIN_SIZE`] elements, scalars land in bin 0.
pub(crate) fn chunk_data(data: &serde_json::Value) -> Result<Vec<(usize, String)>, StoreError> {
    match data {
        serde_json::Value::Array(items) => items
            .chunks(BIN_SIZE)
            .enumerate()
            .map(|(bin_id, chunk)| Ok((bin_id, serde_json::to_string(chunk)?)))
            .collect(),
        scalar => Ok(vec![(0, serde_json::to_string(scalar)?)]),
    }
}

/// Reassemble bin payloads: a single bin decodes as-is, multiple bins
/// concatenate into one list.
pub(crate) fn assemble_data(bins: Vec<String>) -> Result<Option<serde_json::Value>, StoreError> {
    match bins.len() {
        0 => Ok(None),
        1 => Ok(Some(serde_json::from_str(&bins[0])?)),
        _ => {
            let mut items = Vec::new();
            for bin in bins {
                let chunk: Vec<serde_json::Value> = serde_json::from_str(&bin)?;
                items.extend(chunk);
            }
            Ok(Some(serde_json::Value::Array(items)))
        }
    }
}

/// Build the contiguous subtask entries for a fresh mapped run, already
/// grouped into bins.
pub(crate) fn subtask_bins(keys: &[String]) -> Vec<(usize, Vec<Subtask>)> {
    keys.chunks(BIN_SIZE)
        .enumerate()
        .map(|(bin_id, chunk)| {
            let base = bin_id * BIN_SIZE;
            let entries = chunk
                .iter()
                .enumerate()
                .map(|(offset, key)| Subtask::new(base + offset, key.clone()))
                .collect();
            (bin_id, entries)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn scalar_data_lands_in_bin_zero() {
        let chunks = chunk_data(&json!({"rows": 10})).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].0, 0);
    }

    #[test]
    fn lists_cascade_into_consecutive_bins() {
        let items: Vec<serde_json::Value> = (0..(2 * BIN_SIZE + 1)).map(|i| json!(i)).collect();
        let chunks = chunk_data(&serde_json::Value::Array(items.clone())).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(
            chunks.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        let reassembled =
            assemble_data(chunks.into_iter().map(|(_, json)| json).collect()).unwrap();
        assert_eq!(reassembled, Some(serde_json::Value::Array(items)));
    }

    #[test]
    fn subtask_indices_are_contiguous_across_bins() {
        let keys: Vec<String> = (0..(BIN_SIZE + 2)).map(|i| format!("k{i}")).collect();
        let bins = subtask_bins(&keys);
        assert_eq!(bins.len(), 2);
        assert_eq!(bins[0].1.first().map(|s| s.i), Some(0));
        assert_eq!(bins[0].1.last().map(|s| s.i), Some(BIN_SIZE - 1));
        assert_eq!(bins[1].1.first().map(|s| s.i), Some(BIN_SIZE));
        assert_eq!(bins[1].1.last().map(|s| s.i), Some(BIN_SIZE + 1));
    }
}
