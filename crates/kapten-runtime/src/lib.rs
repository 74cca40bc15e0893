#![deny(clippy::all)]

//! Thin adapter between the cache engine and a concrete workflow
//! runtime.
//!
//! Implementations decide how a task actually runs: a remote deployment
//! in its own container, or a fan-out of subtask calls onto workers. The
//! engine only observes settled results. [`LocalRuntime`] is the
//! degenerate binding with no external scheduler: deployments are
//! unsupported (forcing inline execution) and fan-out calls run one
//! after another.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("this runtime binding does not support deployment runs")]
    DeploymentsUnsupported,
    #[error("deployment '{name}' finished in a failed state: {message}")]
    DeploymentFailed { name: String, message: String },
}

/// Why one fan-out call failed. Carried as a settled result rather than
/// an error type so a partial wave can be rolled up without unwinding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFailure {
    pub message: String,
}

impl RunFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// One dispatchable unit of work (a subtask or a bundle).
pub type TaskCall<'a> = Pin<Box<dyn Future<Output = Result<(), RunFailure>> + Send + 'a>>;

/// A value passed to a mapped task: either one element per subtask, or a
/// single value broadcast to all of them.
#[derive(Debug, Clone, PartialEq)]
pub enum MapArg {
    Each(Vec<serde_json::Value>),
    Unmapped(serde_json::Value),
}

/// Marker preventing a value from being vectorized when passed to a
/// mapped task.
pub fn unmapped(value: serde_json::Value) -> MapArg {
    MapArg::Unmapped(value)
}

impl MapArg {
    /// The element for subtask position `i`; `None` when a vector is too
    /// short.
    pub fn value_at(&self, i: usize) -> Option<&serde_json::Value> {
        match self {
            MapArg::Each(items) => items.get(i),
            MapArg::Unmapped(value) => Some(value),
        }
    }

    /// Vector length, or `None` for a broadcast value.
    pub fn mapped_len(&self) -> Option<usize> {
        match self {
            MapArg::Each(items) => Some(items.len()),
            MapArg::Unmapped(_) => None,
        }
    }
}

/// Abstract task runner.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Whether [`Runtime::run_deployment`] can launch tasks in separate
    /// containers. When false the engine runs tasks inline.
    fn supports_deployments(&self) -> bool {
        false
    }

    /// Launch a task as a deployment and block until its terminal state
    /// is known; errors on non-success.
    async fn run_deployment(
        &self,
        name: &str,
        parameters: serde_json::Value,
        job_variables: serde_json::Value,
    ) -> Result<(), RuntimeError> {
        let _ = (name, parameters, job_variables);
        Err(RuntimeError::DeploymentsUnsupported)
    }

    /// Dispatch fan-out calls tagged with the task's tags, wait for all
    /// of them, and return their settled results in order.
    async fn map<'a>(
        &self,
        tags: &[String],
        calls: Vec<TaskCall<'a>>,
    ) -> Vec<Result<(), RunFailure>>;
}

/// Runs everything in the current process, sequentially.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRuntime;

#[async_trait]
impl Runtime for LocalRuntime {
    async fn map<'a>(
        &self,
        tags: &[String],
        calls: Vec<TaskCall<'a>>,
    ) -> Vec<Result<(), RunFailure>> {
        debug!(?tags, count = calls.len(), "running fan-out calls inline");
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(call.await);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn local_runtime_settles_each_call_in_order() {
        let runtime = LocalRuntime;
        let calls: Vec<TaskCall<'_>> = vec![
            Box::pin(async { Ok(()) }),
            Box::pin(async { Err(RunFailure::new("boom")) }),
            Box::pin(async { Ok(()) }),
        ];
        let results = runtime.map(&[], calls).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert_eq!(results[1], Err(RunFailure::new("boom")));
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn local_runtime_rejects_deployments() {
        let runtime = LocalRuntime;
        let err = runtime
            .run_deployment("run-task/sample", json!({}), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::DeploymentsUnsupported));
        assert!(!runtime.supports_deployments());
    }

    #[test]
    fn unmapped_values_broadcast() {
        let arg = unmapped(json!("shared"));
        assert_eq!(arg.value_at(0), Some(&json!("shared")));
        assert_eq!(arg.value_at(99), Some(&json!("shared")));
        assert_eq!(arg.mapped_len(), None);

        let arg = MapArg::Each(vec![json!(1), json!(2)]);
        assert_eq!(arg.value_at(1), Some(&json!(2)));
        assert_eq!(arg.value_at(2), None);
        assert_eq!(arg.mapped_len(), Some(2));
    }
}
