//! # WatchMySix Core
//!
//! Job orchestration engine behind the WatchMySix recon dashboard.
//!
//! ## Overview
//!
//! A job runs a set of external recon tools against one target domain. The
//! engine accepts job requests, bounds how many run at once, supervises the
//! tool processes and fans their output out to any number of observers:
//!
//! - **Scheduling**: FIFO queue drained by a fixed pool of worker slots
//! - **Process supervision**: process-group launch, per-step timeouts, grace-kill on cancel
//! - **Log fan-out**: per-job ordered log with a retained tail and overrun detection
//! - **Artifacts**: per-job file registry with on-demand ZIP bundles
//!
//! ## Architecture
//!
//! - [`engine`]: the [`ReconEngine`] facade wiring everything together
//! - [`job`]: job model, registry state machine and step executor
//! - [`scheduler`]: worker slots pulling from the registry queue
//! - [`tools`]: the tool adapter table
//! - [`process`]: external command supervision
//! - [`logs`]: per-job log hub
//! - [`artifacts`]: per-job artifact tracker

pub mod artifacts;
pub mod engine;
pub mod error;
pub mod ids;
pub mod job;
pub mod logs;
pub mod merge;
pub mod persistence;
pub mod process;
pub mod scheduler;
pub mod settings;
pub mod tools;

pub use artifacts::{Artifact, ArtifactTracker};
pub use engine::{EngineStats, ReconEngine};
pub use error::{ReconError, Result, StepError};
pub use ids::JobId;
pub use job::{
    BruteforceToggle, CancelOutcome, JobRequest, JobSnapshot, JobStatus,
    JobSummary, MergeToggle, StepResult,
};
pub use logs::{LogEntry, LogHub, LogKind, LogStream};
pub use settings::EngineSettings;
pub use tools::{ToolAvailability, ToolCatalog, ToolSpec};
