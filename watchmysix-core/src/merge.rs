//! Post-run result merging.
//!
//! Folds every text artifact of a finished job into one deduplicated list,
//! tracks which entries are new for the target across runs and optionally
//! probes the merged list with httpx.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use once_cell::sync::Lazy;
use tokio::{io::AsyncWriteExt, sync::Mutex as AsyncMutex};
use tracing::{debug, info};

use crate::{
    error::Result,
    job::ClaimedJob,
    process::{CommandSpec, ProcessOutcome, ProcessRunner},
    settings::EngineSettings,
};

pub const MERGED_FILE_NAME: &str = "all_subdomains.txt";
pub const PROBE_FILE_NAME: &str = "httpx_probed.txt";

const PROBE_SOURCE: &str = "httpx-probe";

/// One lock per history file; held across its read-compare-append.
static HISTORY_LOCKS: Lazy<parking_lot::Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>> =
    Lazy::new(Default::default);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeSummary {
    pub sources: usize,
    pub unique: usize,
    pub new_entries: usize,
    pub probed: Option<bool>,
}

pub async fn merge_results(
    job: &ClaimedJob,
    settings: &EngineSettings,
    runner: &ProcessRunner,
    probe_program: &str,
) -> Result<MergeSummary> {
    let logs = &job.runtime.logs;
    let artifacts = &job.runtime.artifacts;

    let sources: Vec<_> = artifacts
        .list()
        .into_iter()
        .filter(|artifact| {
            artifact.name.ends_with(".txt")
                && artifact.name != MERGED_FILE_NAME
                && artifact.name != PROBE_FILE_NAME
        })
        .collect();

    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for artifact in &sources {
        let bytes = tokio::fs::read(&artifact.path).await?;
        for line in String::from_utf8_lossy(&bytes).lines() {
            let line = line.trim();
            if !line.is_empty() && seen.insert(line.to_string()) {
                merged.push(line.to_string());
            }
        }
    }

    let merged_path = job.working_dir.join(MERGED_FILE_NAME);
    tokio::fs::write(&merged_path, join_lines(&merged)).await?;
    artifacts.register(MERGED_FILE_NAME, &merged_path).await?;

    let new_entries = append_history(&settings.history_root(), &job.target, &merged).await?;
    logs.system(format!(
        "merged {} unique entries from {} file(s); {new_entries} new since previous runs",
        merged.len(),
        sources.len()
    ));
    info!(job_id = %job.id, unique = merged.len(), new_entries, "merged job results");

    let probed = if job.merge.probe && !merged.is_empty() && !job.cancel.is_cancelled() {
        Some(probe(job, runner, probe_program, &merged_path).await?)
    } else {
        None
    };

    Ok(MergeSummary {
        sources: sources.len(),
        unique: merged.len(),
        new_entries,
        probed,
    })
}

/// Append entries not yet recorded for `target`; returns how many were new.
/// Concurrent merges for the same target are serialized.
async fn append_history(history_root: &Path, target: &str, entries: &[String]) -> Result<usize> {
    tokio::fs::create_dir_all(history_root).await?;
    let path = history_root.join(format!("{target}.txt"));

    let lock = Arc::clone(HISTORY_LOCKS.lock().entry(path.clone()).or_default());
    let result = {
        let _guard = lock.lock().await;
        append_fresh(&path, entries).await
    };
    drop(lock);
    release_history_lock(&path);
    result
}

fn release_history_lock(path: &Path) {
    let mut locks = HISTORY_LOCKS.lock();
    if locks.get(path).is_some_and(|lock| Arc::strong_count(lock) == 1) {
        locks.remove(path);
    }
}

async fn append_fresh(path: &Path, entries: &[String]) -> Result<usize> {
    let known: HashSet<String> = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents.lines().map(|line| line.trim().to_string()).collect(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
        Err(err) => return Err(err.into()),
    };
    let fresh: Vec<String> = entries
        .iter()
        .filter(|entry| !known.contains(entry.as_str()))
        .cloned()
        .collect();
    if fresh.is_empty() {
        return Ok(0);
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(join_lines(&fresh).as_bytes()).await?;
    file.flush().await?;
    debug!(path = %path.display(), fresh = fresh.len(), "history updated");
    Ok(fresh.len())
}

async fn probe(
    job: &ClaimedJob,
    runner: &ProcessRunner,
    program: &str,
    merged_path: &Path,
) -> Result<bool> {
    let logs = &job.runtime.logs;
    let probe_path = job.working_dir.join(PROBE_FILE_NAME);
    let command = CommandSpec::new(program, &job.working_dir).args([
        "-silent".to_string(),
        "-l".to_string(),
        merged_path.display().to_string(),
        "-o".to_string(),
        probe_path.display().to_string(),
    ]);

    logs.system("probing merged results with httpx");
    let outcome = runner
        .run(&command, |_, text| {
            logs.output(PROBE_SOURCE, text);
        }, &job.cancel)
        .await;

    let ok = match outcome {
        Ok(ProcessOutcome::Exited { code: Some(0) }) => true,
        Ok(other) => {
            logs.system(format!("httpx probe did not complete: {other:?}"));
            false
        }
        Err(err) => {
            logs.system(format!("httpx probe could not start: {err}"));
            false
        }
    };
    if probe_path.exists() {
        job.runtime
            .artifacts
            .register(PROBE_FILE_NAME, &probe_path)
            .await?;
    }
    Ok(ok)
}

fn join_lines(lines: &[String]) -> String {
    let mut body = lines.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[tokio::test]
    async fn history_counts_only_unseen_entries() {
        let root = tempfile::tempdir().unwrap();
        let first = entries(&["a.example.com", "b.example.com"]);
        let second = entries(&["b.example.com", "c.example.com"]);
        let first = append_history(root.path(), "example.com", &first).await.unwrap();
        let second = append_history(root.path(), "example.com", &second).await.unwrap();
        assert_eq!((first, second), (2, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_merges_record_each_entry_once() {
        let root = tempfile::tempdir().unwrap();
        let batch: Vec<String> = (0..200).map(|n| format!("host{n}.example.com")).collect();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let root = root.path().to_path_buf();
                let batch = batch.clone();
                tokio::spawn(async move { append_history(&root, "example.com", &batch).await })
            })
            .collect();
        let mut recorded = 0;
        for task in tasks {
            recorded += task.await.unwrap().unwrap();
        }
        assert_eq!(recorded, batch.len());

        let history = std::fs::read_to_string(root.path().join("example.com.txt")).unwrap();
        let lines: Vec<&str> = history.lines().collect();
        assert_eq!(lines.len(), batch.len());
        assert_eq!(lines.iter().collect::<HashSet<_>>().len(), batch.len());
        assert!(HISTORY_LOCKS.lock().get(&root.path().join("example.com.txt")).is_none());
    }
}
