//! Stored task records, subtask entries, and bin constants.

use serde::{Deserialize, Serialize};

/// Max number of items stuffed into a single storage bin. Chosen as an
/// empirical bound keeping bins under the 400 KB DynamoDB item limit;
/// larger payloads cascade into consecutive bins.
pub const BIN_SIZE: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Success,
    Failure,
    Incomplete,
}

impl AsRef<str> for TaskStatus {
    fn as_ref(&self) -> &str {
        match self {
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
            TaskStatus::Incomplete => "INCOMPLETE",
        }
    }
}

impl TaskStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SUCCESS" => Some(TaskStatus::Success),
            "FAILURE" => Some(TaskStatus::Failure),
            "INCOMPLETE" => Some(TaskStatus::Incomplete),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// One task's cached state. All fields are optional so that partial
/// records merge with last-write-wins per field.
///
/// The `*_hashes` fields hold the *serialized* hash tree (the raw file
/// hash for Python, canonical JSON otherwise); the derived `*_version`
/// accessors fingerprint that string and are never stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ecs_task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub py_code_hashes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r_code_hashes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_hashes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_data_hashes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_data_version: Option<String>,
    /// The in-memory result; stored in data bins, retrieved lazily.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl TaskState {
    pub fn py_code_version(&self) -> Option<String> {
        self.py_code_hashes.as_deref().map(kapten_hash::fingerprint_str)
    }

    pub fn r_code_version(&self) -> Option<String> {
        self.r_code_hashes.as_deref().map(kapten_hash::fingerprint_str)
    }

    pub fn inputs_version(&self) -> Option<String> {
        self.input_hashes.as_deref().map(kapten_hash::fingerprint_str)
    }

    pub fn input_data_version(&self) -> Option<String> {
        self.input_data_hashes
            .as_deref()
            .map(kapten_hash::fingerprint_str)
    }

    /// Overlay `patch`'s non-null fields onto `self`.
    pub fn merge_from(&mut self, patch: &TaskState) {
        macro_rules! take {
            ($field:ident) => {
                if patch.$field.is_some() {
                    self.$field = patch.$field.clone();
                }
            };
        }
        take!(ecs_task_id);
        take!(py_code_hashes);
        take!(r_code_hashes);
        take!(input_hashes);
        take!(input_data_hashes);
        take!(outputs_version);
        take!(output_data_version);
        take!(data);
        take!(status);
        take!(start_time);
        take!(end_time);
        take!(updated_at);
    }
}

/// One element of a mapped task. Field names match the stored wire
/// format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub i: usize,
    pub key: String,
    #[serde(
        rename = "startTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub start_time: Option<String>,
    #[serde(rename = "endTime", default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(
        rename = "outputHash",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub output_hash: Option<String>,
}

impl Subtask {
    pub fn new(i: usize, key: String) -> Self {
        Self {
            i,
            key,
            start_time: None,
            end_time: None,
            output_hash: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinKind {
    TaskData,
    Subset,
    Subtask,
}

impl AsRef<str> for BinKind {
    fn as_ref(&self) -> &str {
        match self {
            BinKind::TaskData => "TASKDATABIN",
            BinKind::Subset => "SUBSETBIN",
            BinKind::Subtask => "SUBTASKBIN",
        }
    }
}

/// Terminal fields written by the finalizer.
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub result: Option<serde_json::Value>,
    pub result_hash: Option<String>,
    pub outputs_version: Option<String>,
    pub status: Option<TaskStatus>,
    pub subset_mode: bool,
}
