pub mod artifacts;
pub mod jobs;
pub mod logs;
pub mod system;

use watchmysix_core::JobId;

use crate::infra::errors::{AppError, AppResult};

/// A malformed id cannot name a job, so it is reported as not found.
pub(crate) fn parse_job_id(raw: &str) -> AppResult<JobId> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::not_found(format!("job {raw} not found")))
}
