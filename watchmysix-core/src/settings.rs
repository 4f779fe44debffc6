//! Engine-wide tunables.
//!
//! The server crate composes these from its configuration layers; tests
//! build them directly with [`EngineSettings::for_data_root`].

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use crate::error::{ReconError, Result};

pub const DEFAULT_MAX_CONCURRENCY: usize = 3;
pub const DEFAULT_STEP_CONCURRENCY: usize = 4;
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_LOG_RETENTION: usize = 2000;
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 1024;
pub const DEFAULT_CRTSH_ENDPOINT: &str = "https://crt.sh/";

/// Directory under the data root holding one working directory per job.
pub const JOBS_DIR: &str = "jobs";
/// Directory under the data root holding per-target result history.
pub const HISTORY_DIR: &str = "history";

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub data_root: PathBuf,
    /// Number of worker slots, i.e. jobs allowed in `Running` at once.
    pub max_concurrency: usize,
    /// Steps of a single job allowed to run in parallel.
    pub step_concurrency: usize,
    pub step_timeout: Duration,
    /// Time between SIGTERM and SIGKILL when a step is interrupted.
    pub kill_grace: Duration,
    /// Log lines retained per job for late subscribers.
    pub log_retention: usize,
    /// Per-subscriber queue depth before the subscriber is overrun.
    pub subscriber_queue: usize,
    pub wordlist_dir: PathBuf,
    pub resolver_dir: PathBuf,
    /// Environment passed to every step (provider API keys and the like).
    pub step_environment: BTreeMap<String, String>,
    pub crtsh_endpoint: String,
    /// Write `job.json`/`job.log` and rehydrate them on start.
    pub persist: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/data"),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            step_concurrency: DEFAULT_STEP_CONCURRENCY,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            kill_grace: DEFAULT_KILL_GRACE,
            log_retention: DEFAULT_LOG_RETENTION,
            subscriber_queue: DEFAULT_SUBSCRIBER_QUEUE,
            wordlist_dir: PathBuf::from("/opt/watchmysix/wordlists"),
            resolver_dir: PathBuf::from("/opt/watchmysix/resolvers"),
            step_environment: BTreeMap::new(),
            crtsh_endpoint: DEFAULT_CRTSH_ENDPOINT.to_string(),
            persist: true,
        }
    }
}

impl EngineSettings {
    pub fn for_data_root(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            ..Self::default()
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(ReconError::Validation(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.step_concurrency == 0 {
            return Err(ReconError::Validation(
                "step_concurrency must be at least 1".into(),
            ));
        }
        if self.step_timeout.is_zero() {
            return Err(ReconError::Validation(
                "step_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn jobs_root(&self) -> PathBuf {
        self.data_root.join(JOBS_DIR)
    }

    pub fn history_root(&self) -> PathBuf {
        self.data_root.join(HISTORY_DIR)
    }

    pub fn default_static_wordlist(&self) -> PathBuf {
        self.wordlist_dir
            .join("static-dns")
            .join("best-dns-wordlist.txt")
    }

    pub fn default_dynamic_wordlist(&self) -> PathBuf {
        self.wordlist_dir.join("dynamic-dns").join("words-merged.txt")
    }

    pub fn default_resolvers(&self) -> PathBuf {
        self.resolver_dir.join("resolvers.txt")
    }
}
