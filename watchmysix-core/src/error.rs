use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ids::JobId, job::JobStatus};

#[derive(Error, Debug)]
pub enum ReconError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Artifact '{name}' not found for job {job_id}")]
    ArtifactNotFound { job_id: JobId, name: String },

    #[error("Job {job_id} is already {status}")]
    AlreadyTerminal { job_id: JobId, status: JobStatus },

    #[error("Step '{tool}' failed: {message}")]
    StepExecution { tool: String, message: String },

    #[error("Step '{tool}' timed out after {}s", .after.as_secs())]
    StepTimeout { tool: String, after: Duration },

    #[error("Step '{tool}' was cancelled")]
    StepCancelled { tool: String },

    #[error("Log subscriber fell behind and missed {skipped} entries")]
    SubscriberOverrun { skipped: u64 },

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ReconError>;

/// Outcome of a failed step as recorded in a job's step results.
///
/// Step failures never escape the step executor as `Err`; they are stored
/// alongside the exit code so sibling steps keep running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    /// Nonzero exit, signal death or launch failure.
    Execution { message: String },
    /// The step exceeded its timeout and was killed.
    Timeout { after_secs: u64 },
    /// The job was cancelled while the step was running.
    Cancelled,
}

impl StepError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::Timeout {
            after_secs: after.as_secs(),
        }
    }

    /// Lift into the engine error taxonomy, attributing it to `tool`.
    pub fn into_error(self, tool: &str) -> ReconError {
        let tool = tool.to_string();
        match self {
            Self::Execution { message } => {
                ReconError::StepExecution { tool, message }
            }
            Self::Timeout { after_secs } => ReconError::StepTimeout {
                tool,
                after: Duration::from_secs(after_secs),
            },
            Self::Cancelled => ReconError::StepCancelled { tool },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_errors_render_with_tool_name() {
        let err = StepError::timeout(Duration::from_secs(90)).into_error("gau");
        assert_eq!(err.to_string(), "Step 'gau' timed out after 90s");

        let err = StepError::execution("exited with status 2").into_error("dnsx");
        assert_eq!(
            err.to_string(),
            "Step 'dnsx' failed: exited with status 2"
        );

        assert!(matches!(
            StepError::Cancelled.into_error("chaos"),
            ReconError::StepCancelled { .. }
        ));
    }

    #[test]
    fn step_error_serializes_with_kind_tag() {
        let value = serde_json::to_value(StepError::Cancelled).unwrap();
        assert_eq!(value, serde_json::json!({ "kind": "cancelled" }));
    }
}
