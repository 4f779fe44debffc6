//! On-disk job snapshots.
//!
//! Each working directory carries a `job.json` rewritten at dispatch and at
//! the terminal transition, next to the `job.log` mirror of its log hub.

use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::{
    error::Result,
    job::JobSnapshot,
    logs::{LOG_FILE_NAME, read_log_file},
};

pub const SNAPSHOT_FILE_NAME: &str = "job.json";
const SNAPSHOT_TMP_NAME: &str = ".job.json.tmp";

#[derive(Debug, Clone)]
pub struct PersistedJob {
    pub snapshot: JobSnapshot,
    pub log_lines: Vec<(DateTime<Utc>, String)>,
}

/// Atomically replace `job.json` in the snapshot's working directory.
pub async fn write_snapshot(snapshot: &JobSnapshot) -> Result<()> {
    let dir = &snapshot.working_dir;
    let tmp = dir.join(SNAPSHOT_TMP_NAME);
    let bytes = serde_json::to_vec_pretty(snapshot)?;
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, dir.join(SNAPSHOT_FILE_NAME)).await?;
    Ok(())
}

/// Load every job directory under `jobs_root`, oldest first. Unreadable
/// snapshots are skipped with a warning.
pub async fn load_jobs(jobs_root: &Path) -> Result<Vec<PersistedJob>> {
    let mut dir = match tokio::fs::read_dir(jobs_root).await {
        Ok(dir) => dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut jobs = Vec::new();
    while let Some(entry) = dir.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let job_dir = entry.path();
        match load_job(&job_dir).await {
            Ok(Some(job)) => jobs.push(job),
            Ok(None) => {}
            Err(err) => {
                warn!(path = %job_dir.display(), error = %err, "skipping unreadable job snapshot");
            }
        }
    }
    jobs.sort_by_key(|job| job.snapshot.created_at);
    Ok(jobs)
}

async fn load_job(job_dir: &Path) -> Result<Option<PersistedJob>> {
    let bytes = match tokio::fs::read(job_dir.join(SNAPSHOT_FILE_NAME)).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut snapshot: JobSnapshot = serde_json::from_slice(&bytes)?;
    // The data root may have moved since the snapshot was written.
    snapshot.working_dir = job_dir.to_path_buf();

    let fallback = snapshot.finished_at.unwrap_or(snapshot.created_at);
    let log_lines = match read_log_file(&job_dir.join(LOG_FILE_NAME), fallback).await {
        Ok(lines) => lines,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(err.into()),
    };

    Ok(Some(PersistedJob {
        snapshot,
        log_lines,
    }))
}
