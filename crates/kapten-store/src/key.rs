//! Key layout shared by the storage back-ends.
//!
//! Partition key: `BRANCH#{storage_key}`. Sort keys:
//! `PIPELINE#{pipeline}#TASK#{task}` for the task record, with an
//! optional `#{bin_type}#{bin_id}` suffix for bins.

use crate::models::BinKind;

#[derive(Debug, Clone)]
pub struct StoreKey {
    pub storage_key: String,
    pub pipeline: String,
}

impl StoreKey {
    pub fn new(storage_key: impl Into<String>, pipeline: impl Into<String>) -> Self {
        Self {
            storage_key: storage_key.into(),
            pipeline: pipeline.into(),
        }
    }

    pub fn partition(&self) -> String {
        format!("BRANCH#{}", self.storage_key)
    }

    pub fn task_sort(&self, task: &str) -> String {
        format!("PIPELINE#{}#TASK#{}", self.pipeline, task)
    }

    pub fn bin_sort(&self, task: &str, kind: BinKind, bin_id: usize) -> String {
        format!("{}#{}#{}", self.task_sort(task), kind.as_ref(), bin_id)
    }

    pub fn bin_prefix(&self, task: &str, kind: BinKind) -> String {
        format!("{}#{}#", self.task_sort(task), kind.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn sort_keys_nest_under_the_task_prefix() {
        let key = StoreKey::new("dev", "sample");
        assert_eq!(key.partition(), "BRANCH#dev");
        assert_eq!(key.task_sort("clean"), "PIPELINE#sample#TASK#clean");
        assert_eq!(
            key.bin_sort("clean", BinKind::Subtask, 1),
            "PIPELINE#sample#TASK#clean#SUBTASKBIN#1"
        );
        assert!(key
            .bin_sort("clean", BinKind::TaskData, 0)
            .starts_with(&key.bin_prefix("clean", BinKind::TaskData)));
    }
}
