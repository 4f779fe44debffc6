//! Job registry: the single source of truth for job status.
//!
//! Records, the dispatch queue and submission order live behind one lock so
//! that creation+enqueue, claim and every status transition are atomic
//! check-and-set operations.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    path::PathBuf,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{
    CancelOutcome, JobRequest, JobSnapshot, JobStatus, JobSummary, MergeToggle, StepResult,
    normalize_target,
};
use crate::{
    artifacts::ArtifactTracker,
    error::{ReconError, Result},
    ids::JobId,
    logs::LogHub,
    settings::EngineSettings,
    tools::{BruteforceFlavor, StepOptions, ToolCatalog},
};

/// Per-job resources owned by the job for its whole lifetime.
#[derive(Debug)]
pub struct JobRuntime {
    pub logs: Arc<LogHub>,
    pub artifacts: Arc<ArtifactTracker>,
}

/// Everything a worker slot needs to execute a job it has claimed.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: JobId,
    pub target: String,
    pub tools: Vec<String>,
    pub step_options: BTreeMap<String, StepOptions>,
    pub merge: MergeToggle,
    pub environment: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    pub cancel: CancellationToken,
    pub runtime: Arc<JobRuntime>,
}

#[derive(Debug)]
struct JobRecord {
    snapshot: JobSnapshot,
    environment: BTreeMap<String, String>,
    cancel: CancellationToken,
    runtime: Arc<JobRuntime>,
}

#[derive(Debug)]
struct RegistryState {
    jobs: HashMap<JobId, JobRecord>,
    /// Submission order, oldest first.
    order: Vec<JobId>,
    queue: VecDeque<JobId>,
    accepting: bool,
}

#[derive(Debug)]
pub struct JobRegistry {
    settings: Arc<EngineSettings>,
    catalog: Arc<ToolCatalog>,
    state: Mutex<RegistryState>,
    work_available: Arc<Notify>,
}

impl JobRegistry {
    pub fn new(settings: Arc<EngineSettings>, catalog: Arc<ToolCatalog>) -> Self {
        Self {
            settings,
            catalog,
            state: Mutex::new(RegistryState {
                jobs: HashMap::new(),
                order: Vec::new(),
                queue: VecDeque::new(),
                accepting: true,
            }),
            work_available: Arc::new(Notify::new()),
        }
    }

    /// Signalled once per submission.
    pub fn work_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.work_available)
    }

    pub fn submit(&self, request: JobRequest) -> Result<JobId> {
        let target = normalize_target(&request.target)?;
        let (tools, step_options) = self.resolve_tools(&request)?;

        let id = JobId::new();
        let working_dir = self.settings.jobs_root().join(id.to_string());
        let logs = Arc::new(LogHub::new(
            id,
            self.settings.log_retention,
            self.settings.subscriber_queue,
        ));
        let artifacts = Arc::new(
            ArtifactTracker::new(id, &working_dir).announcing_to(Arc::clone(&logs)),
        );
        logs.system(format!(
            "job queued: target={target} tools={}",
            tools.join(",")
        ));

        let record = JobRecord {
            snapshot: JobSnapshot {
                id,
                target: target.clone(),
                requested_tools: tools,
                status: JobStatus::Queued,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
                step_results: Vec::new(),
                working_dir,
                cancel_requested: false,
                error: None,
                step_options,
                merge: request.merge.unwrap_or_default(),
            },
            environment: request.environment,
            cancel: CancellationToken::new(),
            runtime: Arc::new(JobRuntime { logs, artifacts }),
        };

        {
            let mut state = self.state.lock();
            if !state.accepting {
                return Err(ReconError::ShuttingDown);
            }
            state.jobs.insert(id, record);
            state.order.push(id);
            state.queue.push_back(id);
        }
        self.work_available.notify_one();

        info!(job_id = %id, %target, "job queued");
        Ok(id)
    }

    /// Deduplicate requested tools, fold in enabled bruteforce toggles and
    /// resolve wordlist options.
    fn resolve_tools(
        &self,
        request: &JobRequest,
    ) -> Result<(Vec<String>, BTreeMap<String, StepOptions>)> {
        let mut tools: Vec<String> = Vec::new();
        for raw in &request.tools {
            let id = raw.trim();
            if id.is_empty() {
                continue;
            }
            if !self.catalog.contains(id) {
                return Err(ReconError::Validation(format!("unknown tool '{id}'")));
            }
            if !tools.iter().any(|existing| existing == id) {
                tools.push(id.to_string());
            }
        }

        for (flavor, toggle) in [
            (BruteforceFlavor::Static, &request.static_bruteforce),
            (BruteforceFlavor::Dynamic, &request.dynamic_bruteforce),
        ] {
            if !toggle.as_ref().is_some_and(|toggle| toggle.enabled) {
                continue;
            }
            let spec = self.catalog.bruteforce_tool(flavor).ok_or_else(|| {
                ReconError::Validation(format!("no tool is configured for {flavor} bruteforce"))
            })?;
            if !tools.contains(&spec.id) {
                tools.push(spec.id.clone());
            }
        }

        if tools.is_empty() {
            return Err(ReconError::Validation(
                "at least one tool must be selected".into(),
            ));
        }

        let mut step_options = BTreeMap::new();
        for id in &tools {
            let Some(flavor) = self.catalog.get(id).and_then(|spec| spec.bruteforce) else {
                continue;
            };
            let (toggle, default_wordlist) = match flavor {
                BruteforceFlavor::Static => (
                    request.static_bruteforce.as_ref(),
                    self.settings.default_static_wordlist(),
                ),
                BruteforceFlavor::Dynamic => (
                    request.dynamic_bruteforce.as_ref(),
                    self.settings.default_dynamic_wordlist(),
                ),
            };
            let toggle = toggle.cloned().unwrap_or_default();
            step_options.insert(
                id.clone(),
                StepOptions {
                    wordlist: Some(toggle.wordlist.unwrap_or(default_wordlist)),
                    resolvers: Some(
                        toggle
                            .resolvers
                            .unwrap_or_else(|| self.settings.default_resolvers()),
                    ),
                    threads: toggle.threads,
                    extra_args: toggle.extra_args,
                },
            );
        }

        Ok((tools, step_options))
    }

    pub fn get(&self, id: JobId) -> Result<JobSnapshot> {
        self.state
            .lock()
            .jobs
            .get(&id)
            .map(|record| record.snapshot.clone())
            .ok_or(ReconError::JobNotFound(id))
    }

    pub fn runtime(&self, id: JobId) -> Result<Arc<JobRuntime>> {
        self.state
            .lock()
            .jobs
            .get(&id)
            .map(|record| Arc::clone(&record.runtime))
            .ok_or(ReconError::JobNotFound(id))
    }

    /// Most recent first.
    pub fn list(&self) -> Vec<JobSummary> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .rev()
            .filter_map(|id| state.jobs.get(id))
            .map(|record| record.snapshot.summary())
            .collect()
    }

    pub fn cancel(&self, id: JobId) -> Result<CancelOutcome> {
        let dequeued = {
            let mut guard = self.state.lock();
            let RegistryState { jobs, queue, .. } = &mut *guard;
            let record = jobs.get_mut(&id).ok_or(ReconError::JobNotFound(id))?;

            match record.snapshot.status {
                JobStatus::Queued => {
                    queue.retain(|queued| *queued != id);
                    record.snapshot.status = JobStatus::Cancelled;
                    record.snapshot.cancel_requested = true;
                    record.snapshot.finished_at = Some(later_of(record.snapshot.created_at));
                    record.cancel.cancel();
                    Arc::clone(&record.runtime)
                }
                JobStatus::Running => {
                    if !record.snapshot.cancel_requested {
                        record.snapshot.cancel_requested = true;
                        record.cancel.cancel();
                        record.runtime.logs.system("cancellation requested");
                        info!(job_id = %id, "cancelling running job");
                    }
                    return Ok(CancelOutcome::Cancelling);
                }
                status => {
                    return Err(ReconError::AlreadyTerminal { job_id: id, status });
                }
            }
        };

        dequeued.logs.system("job cancelled before dispatch");
        dequeued.logs.close();
        info!(job_id = %id, "cancelled queued job");
        Ok(CancelOutcome::Cancelled)
    }

    /// Pop the head of the queue and mark it `Running`.
    pub fn claim_next(&self) -> Option<ClaimedJob> {
        let mut guard = self.state.lock();
        if !guard.accepting {
            return None;
        }
        let RegistryState { jobs, queue, .. } = &mut *guard;

        while let Some(id) = queue.pop_front() {
            let Some(record) = jobs.get_mut(&id) else {
                continue;
            };
            if record.snapshot.status != JobStatus::Queued {
                continue;
            }

            record.snapshot.status = JobStatus::Running;
            record.snapshot.started_at = Some(later_of(record.snapshot.created_at));
            return Some(ClaimedJob {
                id,
                target: record.snapshot.target.clone(),
                tools: record.snapshot.requested_tools.clone(),
                step_options: record.snapshot.step_options.clone(),
                merge: record.snapshot.merge,
                environment: record.environment.clone(),
                working_dir: record.snapshot.working_dir.clone(),
                cancel: record.cancel.clone(),
                runtime: Arc::clone(&record.runtime),
            });
        }
        None
    }

    /// Append a step outcome. Returns `false` if the job is not running or
    /// already holds one result per requested tool.
    pub fn record_step(&self, id: JobId, result: StepResult) -> bool {
        let mut state = self.state.lock();
        let Some(record) = state.jobs.get_mut(&id) else {
            return false;
        };
        let snapshot = &mut record.snapshot;
        if snapshot.status != JobStatus::Running
            || snapshot.step_results.len() >= snapshot.requested_tools.len()
        {
            return false;
        }
        snapshot.step_results.push(result);
        true
    }

    pub fn any_step_succeeded(&self, id: JobId) -> bool {
        self.state.lock().jobs.get(&id).is_some_and(|record| {
            record
                .snapshot
                .step_results
                .iter()
                .any(StepResult::succeeded)
        })
    }

    /// Classify and record the terminal status of a running job.
    ///
    /// A raised cancel signal wins; otherwise any successful step makes the
    /// job `Succeeded`, and no successful step makes it `Failed`.
    pub fn finish(&self, id: JobId) -> Result<JobSnapshot> {
        self.transition_terminal(id, |record| {
            if record.cancel.is_cancelled() {
                JobStatus::Cancelled
            } else if record
                .snapshot
                .step_results
                .iter()
                .any(StepResult::succeeded)
            {
                JobStatus::Succeeded
            } else {
                JobStatus::Failed
            }
        })
    }

    /// Force a running job to `Failed`, e.g. when its executor died.
    pub fn fail(&self, id: JobId, reason: &str) -> Result<JobSnapshot> {
        let snapshot = self.transition_terminal(id, |record| {
            record.snapshot.error = Some(reason.to_string());
            JobStatus::Failed
        })?;
        if let Ok(runtime) = self.runtime(id) {
            runtime.logs.system(format!("job failed: {reason}"));
            runtime.logs.close();
        }
        Ok(snapshot)
    }

    fn transition_terminal(
        &self,
        id: JobId,
        classify: impl FnOnce(&mut JobRecord) -> JobStatus,
    ) -> Result<JobSnapshot> {
        let mut state = self.state.lock();
        let record = state.jobs.get_mut(&id).ok_or(ReconError::JobNotFound(id))?;
        match record.snapshot.status {
            JobStatus::Running => {}
            status if status.is_terminal() => {
                return Err(ReconError::AlreadyTerminal { job_id: id, status });
            }
            status => {
                return Err(ReconError::Internal(format!(
                    "job {id} cannot finish from {status}"
                )));
            }
        }

        let status = classify(record);
        let started = record.snapshot.started_at.unwrap_or(record.snapshot.created_at);
        record.snapshot.status = status;
        record.snapshot.finished_at = Some(later_of(started));
        Ok(record.snapshot.clone())
    }

    /// Load a job persisted by an earlier process. Jobs that were still
    /// queued or running are recorded as failed.
    pub fn restore(
        &self,
        mut snapshot: JobSnapshot,
        log_lines: Vec<(DateTime<Utc>, String)>,
    ) -> Option<(JobSnapshot, Arc<JobRuntime>)> {
        let id = snapshot.id;
        if !snapshot.status.is_terminal() {
            snapshot.status = JobStatus::Failed;
            snapshot.error = Some("interrupted by restart".to_string());
            let started = snapshot.started_at.unwrap_or(snapshot.created_at);
            snapshot.finished_at = Some(later_of(started));
        }

        let logs = Arc::new(LogHub::restored(id, self.settings.log_retention, log_lines));
        let artifacts = Arc::new(ArtifactTracker::new(id, &snapshot.working_dir));
        let runtime = Arc::new(JobRuntime { logs, artifacts });

        let mut state = self.state.lock();
        if state.jobs.contains_key(&id) {
            warn!(job_id = %id, "skipping duplicate persisted job");
            return None;
        }
        state.jobs.insert(
            id,
            JobRecord {
                snapshot: snapshot.clone(),
                environment: BTreeMap::new(),
                cancel: CancellationToken::new(),
                runtime: Arc::clone(&runtime),
            },
        );
        state.order.push(id);
        Some((snapshot, runtime))
    }

    pub fn running_count(&self) -> usize {
        self.count(JobStatus::Running)
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn count(&self, status: JobStatus) -> usize {
        self.state
            .lock()
            .jobs
            .values()
            .filter(|record| record.snapshot.status == status)
            .count()
    }

    /// Stop accepting submissions and cancel every job still waiting for a
    /// slot. Returns how many queued jobs were cancelled.
    pub fn close_intake(&self) -> usize {
        let dequeued: Vec<Arc<JobRuntime>> = {
            let mut guard = self.state.lock();
            guard.accepting = false;
            let RegistryState { jobs, queue, .. } = &mut *guard;
            queue
                .drain(..)
                .filter_map(|id| {
                    let record = jobs.get_mut(&id)?;
                    if record.snapshot.status != JobStatus::Queued {
                        return None;
                    }
                    mark_shutdown(record);
                    record.snapshot.status = JobStatus::Cancelled;
                    record.snapshot.finished_at = Some(later_of(record.snapshot.created_at));
                    Some(Arc::clone(&record.runtime))
                })
                .collect()
        };
        self.work_available.notify_waiters();

        for runtime in &dequeued {
            runtime.logs.system("job cancelled before dispatch: engine shut down");
            runtime.logs.close();
        }
        dequeued.len()
    }

    /// Raise the cancel signal of every running job.
    pub fn cancel_running(&self) -> usize {
        let mut state = self.state.lock();
        let mut cancelled = 0;
        for record in state.jobs.values_mut() {
            if record.snapshot.status == JobStatus::Running && !record.cancel.is_cancelled() {
                mark_shutdown(record);
                record.runtime.logs.system("cancelled by engine shutdown");
                cancelled += 1;
            }
        }
        cancelled
    }
}

/// Recorded as the job error when shutdown, not a user, cancelled it.
pub const SHUTDOWN_REASON: &str = "cancelled by engine shutdown";

fn mark_shutdown(record: &mut JobRecord) {
    record.snapshot.cancel_requested = true;
    record.snapshot.error = Some(SHUTDOWN_REASON.to_string());
    record.cancel.cancel();
}

/// `now`, but never earlier than `floor`.
fn later_of(floor: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(floor)
}
