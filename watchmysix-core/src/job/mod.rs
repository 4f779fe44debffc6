//! Job model and lifecycle.
//!
//! ```text
//! Queued ──▶ Running ──▶ Succeeded | Failed | Cancelled
//!    └──────────────────────────────────────▲ (cancel before dispatch)
//! ```

pub mod executor;
pub mod registry;

use std::{collections::BTreeMap, fmt, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ReconError, Result, StepError},
    ids::JobId,
    tools::StepOptions,
};

pub use executor::JobExecutor;
pub use registry::{ClaimedJob, JobRegistry, JobRuntime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one attempted tool step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub tool: String,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl StepResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Variant configuration for a wordlist bruteforce step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BruteforceToggle {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub wordlist: Option<PathBuf>,
    #[serde(default)]
    pub resolvers: Option<PathBuf>,
    #[serde(default)]
    pub threads: Option<u32>,
    /// Extra argv entries appended verbatim.
    #[serde(default, alias = "tools")]
    pub extra_args: Vec<String>,
}

/// Post-processing: merge every text artifact into one deduplicated list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeToggle {
    #[serde(default)]
    pub enabled: bool,
    /// Probe the merged list with httpx.
    #[serde(default)]
    pub probe: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub target: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub static_bruteforce: Option<BruteforceToggle>,
    #[serde(default)]
    pub dynamic_bruteforce: Option<BruteforceToggle>,
    #[serde(default)]
    pub merge: Option<MergeToggle>,
    /// Extra environment for every step of this job.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl JobRequest {
    pub fn new<I, S>(target: impl Into<String>, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target: target.into(),
            tools: tools.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// Full job state as exposed to API readers and written to `job.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub target: String,
    pub requested_tools: Vec<String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub step_results: Vec<StepResult>,
    pub working_dir: PathBuf,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub step_options: BTreeMap<String, StepOptions>,
    #[serde(default)]
    pub merge: MergeToggle,
}

impl JobSnapshot {
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            target: self.target.clone(),
            status: self.status,
            requested_tools: self.requested_tools.clone(),
            completed_steps: self.step_results.len(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub target: String,
    pub status: JobStatus,
    pub requested_tools: Vec<String>,
    pub completed_steps: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was still queued and is now `Cancelled`.
    Cancelled,
    /// The job is running; its steps are being terminated.
    Cancelling,
}

/// Trim, lowercase and check a target domain.
pub fn normalize_target(raw: &str) -> Result<String> {
    let target = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    let invalid = |reason: &str| {
        Err(ReconError::Validation(format!(
            "invalid target '{}': {reason}",
            raw.trim()
        )))
    };

    if target.is_empty() {
        return Err(ReconError::Validation("target must not be empty".into()));
    }
    if target.len() > 253 {
        return invalid("longer than 253 characters");
    }
    for label in target.split('.') {
        if label.is_empty() {
            return invalid("empty label");
        }
        if label.len() > 63 {
            return invalid("label longer than 63 characters");
        }
        if label.starts_with('-') {
            return invalid("label starts with '-'");
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return invalid("only letters, digits, '-', '_' and '.' are allowed");
        }
    }
    Ok(target)
}
