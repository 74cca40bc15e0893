//! Embedded SQLite back-end for local runs.
//!
//! Mirrors the remote layout with two tables: `task_states` (one row per
//! task record) and `task_bins` (one row per bin, keyed by bin type and
//! id, payload as a JSON string). Targeted subtask mutations use the
//! JSON1 `json_set` function so a write touches one field of one element
//! inside one bin.

use async_trait::async_trait;
use camino::Utf8Path;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use tracing::debug;

use crate::key::StoreKey;
use crate::models::{BinKind, Subtask, TaskOutcome, TaskState, TaskStatus, BIN_SIZE};
use crate::{assemble_data, chunk_data, now_iso, subtask_bins, StateStore, StoreError};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS task_states (
        storage_key TEXT NOT NULL,
        pipeline TEXT NOT NULL,
        task TEXT NOT NULL,
        ecs_task_id TEXT,
        py_code_hashes TEXT,
        r_code_hashes TEXT,
        input_hashes TEXT,
        input_data_hashes TEXT,
        outputs_version TEXT,
        output_data_version TEXT,
        status TEXT,
        start_time TEXT,
        end_time TEXT,
        updated_at TEXT,
        PRIMARY KEY (storage_key, pipeline, task)
    )",
    "CREATE TABLE IF NOT EXISTS task_bins (
        storage_key TEXT NOT NULL,
        pipeline TEXT NOT NULL,
        task TEXT NOT NULL,
        bin_type TEXT NOT NULL,
        bin_id INTEGER NOT NULL,
        data TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (storage_key, pipeline, task, bin_type, bin_id)
    )",
];

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    key: StoreKey,
}

impl SqliteStore {
    /// Open (creating if needed) a database file.
    pub async fn connect(
        path: &Utf8Path,
        storage_key: impl Into<String>,
        pipeline: impl Into<String>,
    ) -> Result<Self, StoreError> {
        Self::connect_url(&format!("sqlite://{path}?mode=rwc"), storage_key, pipeline).await
    }

    /// An in-memory database, handy for tests and dry runs.
    pub async fn in_memory(
        storage_key: impl Into<String>,
        pipeline: impl Into<String>,
    ) -> Result<Self, StoreError> {
        Self::connect_url("sqlite::memory:", storage_key, pipeline).await
    }

    async fn connect_url(
        url: &str,
        storage_key: impl Into<String>,
        pipeline: impl Into<String>,
    ) -> Result<Self, StoreError> {
        // A single connection keeps :memory: databases coherent and is
        // plenty for a local flow run.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self {
            pool,
            key: StoreKey::new(storage_key, pipeline),
        })
    }

    async fn read_state(&self, task: &str) -> Result<Option<TaskState>, StoreError> {
        let row = sqlx::query(
            "SELECT ecs_task_id, py_code_hashes, r_code_hashes, input_hashes, \
             input_data_hashes, outputs_version, output_data_version, status, start_time, \
             end_time, updated_at FROM task_states WHERE storage_key = ? AND pipeline = ? AND \
             task = ?",
        )
        .bind(self.key.storage_key.as_str())
        .bind(self.key.pipeline.as_str())
        .bind(task)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| TaskState {
            ecs_task_id: row.get("ecs_task_id"),
            py_code_hashes: row.get("py_code_hashes"),
            r_code_hashes: row.get("r_code_hashes"),
            input_hashes: row.get("input_hashes"),
            input_data_hashes: row.get("input_data_hashes"),
            outputs_version: row.get("outputs_version"),
            output_data_version: row.get("output_data_version"),
            data: None,
            status: row
                .get::<Option<String>, _>("status")
                .as_deref()
                .and_then(TaskStatus::parse),
            start_time: row.get("start_time"),
            end_time: row.get("end_time"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn write_state(&self, task: &str, state: &TaskState) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO task_states (storage_key, pipeline, task, ecs_task_id, \
             py_code_hashes, r_code_hashes, input_hashes, input_data_hashes, outputs_version, \
             output_data_version, status, start_time, end_time, updated_at) VALUES (?, ?, ?, ?, \
             ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(self.key.storage_key.as_str())
        .bind(self.key.pipeline.as_str())
        .bind(task)
        .bind(state.ecs_task_id.as_deref())
        .bind(state.py_code_hashes.as_deref())
        .bind(state.r_code_hashes.as_deref())
        .bind(state.input_hashes.as_deref())
        .bind(state.input_data_hashes.as_deref())
        .bind(state.outputs_version.as_deref())
        .bind(state.output_data_version.as_deref())
        .bind(state.status.map(|status| status.as_ref().to_owned()))
        .bind(state.start_time.as_deref())
        .bind(state.end_time.as_deref())
        .bind(state.updated_at.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn write_bins(
        &self,
        task: &str,
        kind: BinKind,
        bins: Vec<(usize, String)>,
    ) -> Result<(), StoreError> {
        let timestamp = now_iso();
        for (bin_id, payload) in bins {
            sqlx::query(
                "INSERT OR REPLACE INTO task_bins (storage_key, pipeline, task, bin_type, \
                 bin_id, data, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(self.key.storage_key.as_str())
            .bind(self.key.pipeline.as_str())
            .bind(task)
            .bind(kind.as_ref())
            .bind(bin_id as i64)
            .bind(payload)
            .bind(timestamp.as_str())
            .bind(timestamp.as_str())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn read_bins(&self, task: &str, kind: BinKind) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT data FROM task_bins WHERE storage_key = ? AND pipeline = ? AND task = ? AND \
             bin_type = ? ORDER BY bin_id",
        )
        .bind(self.key.storage_key.as_str())
        .bind(self.key.pipeline.as_str())
        .bind(task)
        .bind(kind.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| row.get("data")).collect())
    }

    async fn delete_bins(&self, task: &str, kind: BinKind) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM task_bins WHERE storage_key = ? AND pipeline = ? AND task = ? AND \
             bin_type = ?",
        )
        .bind(self.key.storage_key.as_str())
        .bind(self.key.pipeline.as_str())
        .bind(task)
        .bind(kind.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_subtask_field(
        &self,
        task: &str,
        index: usize,
        assignments: &[(&str, &str)],
    ) -> Result<(), StoreError> {
        let bin_id = (index / BIN_SIZE) as i64;
        let element = index % BIN_SIZE;
        let timestamp = now_iso();
        // json_set(data, '$[n].field', value, ...) patches in place.
        let mut expr = String::from("data");
        for (field, _) in assignments {
            expr = format!("json_set({expr}, '$[{element}].{field}', ?)");
        }
        let sql = format!(
            "UPDATE task_bins SET data = {expr}, updated_at = ? WHERE storage_key = ? AND \
             pipeline = ? AND task = ? AND bin_type = ? AND bin_id = ?"
        );
        let mut query = sqlx::query(&sql);
        for (_, value) in assignments {
            query = query.bind(*value);
        }
        let result = query
            .bind(timestamp.as_str())
            .bind(self.key.storage_key.as_str())
            .bind(self.key.pipeline.as_str())
            .bind(task)
            .bind(BinKind::Subtask.as_ref())
            .bind(bin_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SubtaskIndex {
                task: task.to_owned(),
                index,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn create_task(
        &self,
        task: &str,
        state: &TaskState,
        data: Option<&serde_json::Value>,
    ) -> Result<(), StoreError> {
        debug!("create_task({task})");
        self.write_state(task, state).await?;
        if let Some(data) = data.or(state.data.as_ref()) {
            self.write_bins(task, BinKind::TaskData, chunk_data(data)?)
                .await?;
        }
        Ok(())
    }

    async fn update_task(&self, task: &str, patch: &TaskState) -> Result<(), StoreError> {
        let mut state = self.read_state(task).await?.unwrap_or_default();
        state.merge_from(patch);
        state.data = None;
        self.write_state(task, &state).await
    }

    async fn get_task(
        &self,
        task: &str,
        include_data: bool,
        subset_mode: bool,
    ) -> Result<Option<TaskState>, StoreError> {
        let Some(mut state) = self.read_state(task).await? else {
            return Ok(None);
        };
        if include_data {
            state.data = self.get_taskdata(task, subset_mode).await?;
        }
        Ok(Some(state))
    }

    async fn get_taskdata(
        &self,
        task: &str,
        subset_mode: bool,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        if subset_mode {
            let subset = self.read_bins(task, BinKind::Subset).await?;
            if !subset.is_empty() {
                return assemble_data(subset);
            }
        }
        assemble_data(self.read_bins(task, BinKind::TaskData).await?)
    }

    async fn create_subtasks(&self, task: &str, keys: &[String]) -> Result<(), StoreError> {
        let bins = subtask_bins(keys)
            .into_iter()
            .map(|(bin_id, entries)| Ok((bin_id, serde_json::to_string(&entries)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        self.write_bins(task, BinKind::Subtask, bins).await
    }

    async fn get_subtasks(&self, task: &str) -> Result<Vec<Subtask>, StoreError> {
        let mut subtasks = Vec::new();
        for bin in self.read_bins(task, BinKind::Subtask).await? {
            let entries: Vec<Subtask> = serde_json::from_str(&bin)?;
            subtasks.extend(entries);
        }
        Ok(subtasks)
    }

    async fn set_subtask_started(&self, task: &str, index: usize) -> Result<(), StoreError> {
        let timestamp = now_iso();
        self.set_subtask_field(task, index, &[("startTime", timestamp.as_str())])
            .await
    }

    async fn set_subtask_ended(
        &self,
        task: &str,
        index: usize,
        output_hash: Option<&str>,
    ) -> Result<(), StoreError> {
        let timestamp = now_iso();
        let mut assignments = vec![("endTime", timestamp.as_str())];
        if let Some(hash) = output_hash {
            assignments.push(("outputHash", hash));
        }
        self.set_subtask_field(task, index, &assignments).await
    }

    async fn set_task_ended(&self, task: &str, outcome: &TaskOutcome) -> Result<(), StoreError> {
        let timestamp = now_iso();
        if outcome.subset_mode {
            if let Some(result) = &outcome.result {
                self.update_task(
                    task,
                    &TaskState {
                        updated_at: Some(timestamp),
                        ..Default::default()
                    },
                )
                .await?;
                return self
                    .write_bins(task, BinKind::Subset, chunk_data(result)?)
                    .await;
            }
        }
        let patch = TaskState {
            end_time: Some(timestamp.clone()),
            updated_at: Some(timestamp),
            outputs_version: outcome.outputs_version.clone(),
            output_data_version: outcome.result_hash.clone(),
            status: outcome.status,
            ..Default::default()
        };
        self.update_task(task, &patch).await?;
        if let Some(result) = &outcome.result {
            self.write_bins(task, BinKind::TaskData, chunk_data(result)?)
                .await?;
        }
        Ok(())
    }

    async fn reset_subset_of_subtasks(
        &self,
        task: &str,
        subset: &[String],
    ) -> Result<(), StoreError> {
        let bins = sqlx::query(
            "SELECT bin_id, data FROM task_bins WHERE storage_key = ? AND pipeline = ? AND task \
             = ? AND bin_type = ? ORDER BY bin_id",
        )
        .bind(self.key.storage_key.as_str())
        .bind(self.key.pipeline.as_str())
        .bind(task)
        .bind(BinKind::Subtask.as_ref())
        .fetch_all(&self.pool)
        .await?;
        for row in bins {
            let bin_id: i64 = row.get("bin_id");
            let mut entries: Vec<Subtask> = serde_json::from_str(row.get("data"))?;
            let mut touched = false;
            for entry in &mut entries {
                if subset.contains(&entry.key) {
                    entry.start_time = None;
                    entry.end_time = None;
                    touched = true;
                }
            }
            if touched {
                self.write_bins(
                    task,
                    BinKind::Subtask,
                    vec![(bin_id as usize, serde_json::to_string(&entries)?)],
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn delete_subset_data(&self, task: &str) -> Result<(), StoreError> {
        self.delete_bins(task, BinKind::Subset).await
    }

    async fn delete_task(&self, task: &str) -> Result<(), StoreError> {
        debug!("delete_task({task})");
        self.delete_bins(task, BinKind::Subtask).await?;
        self.delete_bins(task, BinKind::TaskData).await?;
        self.delete_bins(task, BinKind::Subset).await?;
        sqlx::query("DELETE FROM task_states WHERE storage_key = ? AND pipeline = ? AND task = ?")
            .bind(self.key.storage_key.as_str())
            .bind(self.key.pipeline.as_str())
            .bind(task)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    async fn store() -> SqliteStore {
        SqliteStore::in_memory("dev", "sample").await.unwrap()
    }

    #[tokio::test]
    async fn round_trip_merges_with_last_write_wins() {
        let store = store().await;
        store
            .create_task(
                "alpha",
                &TaskState {
                    ecs_task_id: Some("local".to_owned()),
                    start_time: Some("t0".to_owned()),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();

        store
            .update_task(
                "alpha",
                &TaskState {
                    status: Some(TaskStatus::Success),
                    end_time: Some("t1".to_owned()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let state = store.get_task("alpha", false, false).await.unwrap().unwrap();
        assert_eq!(state.start_time.as_deref(), Some("t0"));
        assert_eq!(state.end_time.as_deref(), Some("t1"));
        assert_eq!(state.status, Some(TaskStatus::Success));
    }

    #[tokio::test]
    async fn missing_task_reads_as_none() {
        let store = store().await;
        assert_eq!(store.get_task("ghost", true, false).await.unwrap(), None);
    }

    #[tokio::test]
    async fn data_survives_the_bin_boundary() {
        let store = store().await;
        let data: Vec<serde_json::Value> = (0..(2 * BIN_SIZE + 1)).map(|i| json!(i)).collect();
        store
            .create_task(
                "alpha",
                &TaskState::default(),
                Some(&serde_json::Value::Array(data.clone())),
            )
            .await
            .unwrap();

        let read = store.get_taskdata("alpha", false).await.unwrap();
        assert_eq!(read, Some(serde_json::Value::Array(data)));
    }

    #[tokio::test]
    async fn subtask_mutations_target_one_element() {
        let store = store().await;
        let keys: Vec<String> = ["ca", "ny", "tx"].map(str::to_owned).into();
        store.create_subtasks("clean", &keys).await.unwrap();

        store.set_subtask_started("clean", 1).await.unwrap();
        store
            .set_subtask_ended("clean", 1, Some("hash-ny"))
            .await
            .unwrap();

        let subtasks = store.get_subtasks("clean").await.unwrap();
        assert_eq!(subtasks.len(), 3);
        assert!(subtasks[0].start_time.is_none());
        assert!(subtasks[1].is_finished());
        assert_eq!(subtasks[1].output_hash.as_deref(), Some("hash-ny"));
        assert!(!subtasks[2].is_finished());
    }

    #[tokio::test]
    async fn subtask_mutation_without_bin_errors() {
        let store = store().await;
        let err = store.set_subtask_started("clean", 0).await.unwrap_err();
        assert!(matches!(err, StoreError::SubtaskIndex { index: 0, .. }));
    }

    #[tokio::test]
    async fn subset_results_do_not_disturb_the_full_run_cache() {
        let store = store().await;
        let full: Vec<serde_json::Value> = (0..100).map(|i| json!(i)).collect();
        store
            .create_task(
                "alpha",
                &TaskState {
                    status: Some(TaskStatus::Success),
                    end_time: Some("t1".to_owned()),
                    ..Default::default()
                },
                Some(&serde_json::Value::Array(full.clone())),
            )
            .await
            .unwrap();

        store
            .set_task_ended(
                "alpha",
                &TaskOutcome {
                    result: Some(json!([1, 2, 3])),
                    subset_mode: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Subset reads prefer the side channel.
        assert_eq!(
            store.get_taskdata("alpha", true).await.unwrap(),
            Some(json!([1, 2, 3]))
        );
        // The full-run record and data are untouched.
        let state = store.get_task("alpha", true, false).await.unwrap().unwrap();
        assert_eq!(state.status, Some(TaskStatus::Success));
        assert_eq!(state.end_time.as_deref(), Some("t1"));
        assert_eq!(state.data, Some(serde_json::Value::Array(full)));
    }

    #[tokio::test]
    async fn subset_reads_fall_back_to_task_data() {
        let store = store().await;
        store
            .create_task("alpha", &TaskState::default(), Some(&json!([7, 8])))
            .await
            .unwrap();
        assert_eq!(
            store.get_taskdata("alpha", true).await.unwrap(),
            Some(json!([7, 8]))
        );
    }

    #[tokio::test]
    async fn delete_task_removes_record_and_all_bins() {
        let store = store().await;
        store
            .create_task("alpha", &TaskState::default(), Some(&json!([1])))
            .await
            .unwrap();
        store
            .create_subtasks("alpha", &["k".to_owned()])
            .await
            .unwrap();
        store.delete_task("alpha").await.unwrap();

        assert_eq!(store.get_task("alpha", true, false).await.unwrap(), None);
        assert!(store.get_subtasks("alpha").await.unwrap().is_empty());
        assert_eq!(store.get_taskdata("alpha", false).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reset_subset_clears_progress_marks() {
        let store = store().await;
        let keys: Vec<String> = ["ca", "ny"].map(str::to_owned).into();
        store.create_subtasks("clean", &keys).await.unwrap();
        store.set_subtask_started("clean", 0).await.unwrap();
        store.set_subtask_ended("clean", 0, None).await.unwrap();

        store
            .reset_subset_of_subtasks("clean", &["ca".to_owned()])
            .await
            .unwrap();

        let subtasks = store.get_subtasks("clean").await.unwrap();
        assert!(subtasks[0].start_time.is_none());
        assert!(subtasks[0].end_time.is_none());
    }
}
