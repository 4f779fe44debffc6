//! Runs a claimed job's tool steps.
//!
//! Steps run concurrently up to `step_concurrency`. A failed step is
//! recorded and logged; it never stops its siblings.

use std::{io, sync::Arc};

use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use super::{ClaimedJob, JobRegistry, JobStatus, StepResult};
use crate::{
    error::{ReconError, Result, StepError},
    logs::{LineWriter, WriteMode},
    merge,
    persistence,
    process::{CommandSpec, OutputStream, ProcessOutcome, ProcessRunner},
    settings::EngineSettings,
    tools::{StepContext, StepKind, StepOutput, ToolCatalog, ToolSpec, crtsh},
};

#[derive(Debug)]
pub struct JobExecutor {
    settings: Arc<EngineSettings>,
    catalog: Arc<ToolCatalog>,
    registry: Arc<JobRegistry>,
    runner: ProcessRunner,
    http: reqwest::Client,
}

impl JobExecutor {
    pub fn new(
        settings: Arc<EngineSettings>,
        catalog: Arc<ToolCatalog>,
        registry: Arc<JobRegistry>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("watchmysix/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| ReconError::Internal(format!("http client: {err}")))?;
        Ok(Self {
            runner: ProcessRunner::new(settings.step_timeout, settings.kill_grace),
            settings,
            catalog,
            registry,
            http,
        })
    }

    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    pub async fn run(&self, job: ClaimedJob) -> JobStatus {
        let logs = &job.runtime.logs;
        info!(job_id = %job.id, target = %job.target, tools = job.tools.len(), "job started");

        match tokio::fs::create_dir_all(&job.working_dir).await {
            Ok(()) => {
                if self.settings.persist {
                    logs.attach_file(&job.working_dir);
                    self.persist(&job).await;
                }
                logs.system(format!(
                    "job started: {} step(s), up to {} in parallel",
                    job.tools.len(),
                    self.settings.step_concurrency
                ));

                let steps: Vec<_> = job
                    .tools
                    .iter()
                    .map(|tool| self.run_step(&job, tool))
                    .collect();
                futures::stream::iter(steps)
                    .buffer_unordered(self.settings.step_concurrency)
                    .collect::<Vec<()>>()
                    .await;

                if let Err(err) = job.runtime.artifacts.refresh().await {
                    warn!(job_id = %job.id, error = %err, "artifact scan failed");
                }

                if job.merge.enabled
                    && !job.cancel.is_cancelled()
                    && self.registry.any_step_succeeded(job.id)
                {
                    let probe = self
                        .catalog
                        .get("httpx")
                        .and_then(ToolSpec::program)
                        .unwrap_or("httpx");
                    if let Err(err) =
                        merge::merge_results(&job, &self.settings, &self.runner, probe).await
                    {
                        warn!(job_id = %job.id, error = %err, "result merge failed");
                        logs.system(format!("result merge failed: {err}"));
                    }
                }
            }
            Err(err) => {
                error!(
                    job_id = %job.id,
                    path = %job.working_dir.display(),
                    error = %err,
                    "unable to create working directory"
                );
                logs.system(format!("unable to create working directory: {err}"));
            }
        }

        self.complete(&job).await
    }

    async fn complete(&self, job: &ClaimedJob) -> JobStatus {
        let logs = &job.runtime.logs;
        let snapshot = match self.registry.finish(job.id) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "job already finalized");
                logs.close();
                return self
                    .registry
                    .get(job.id)
                    .map(|snapshot| snapshot.status)
                    .unwrap_or(JobStatus::Failed);
            }
        };

        let succeeded = snapshot.step_results.iter().filter(|r| r.succeeded()).count();
        logs.system(format!(
            "job {}: {succeeded}/{} step(s) succeeded",
            snapshot.status,
            snapshot.requested_tools.len()
        ));
        if self.settings.persist && snapshot.working_dir.exists() {
            if let Err(err) = persistence::write_snapshot(&snapshot).await {
                warn!(job_id = %job.id, error = %err, "failed to persist job snapshot");
            }
        }
        logs.close();

        info!(
            job_id = %job.id,
            status = %snapshot.status,
            succeeded,
            steps = snapshot.step_results.len(),
            "job finished"
        );
        snapshot.status
    }

    async fn persist(&self, job: &ClaimedJob) {
        match self.registry.get(job.id) {
            Ok(snapshot) => {
                if let Err(err) = persistence::write_snapshot(&snapshot).await {
                    warn!(job_id = %job.id, error = %err, "failed to persist job snapshot");
                }
            }
            Err(err) => warn!(job_id = %job.id, error = %err, "job vanished before start"),
        }
    }

    async fn run_step(&self, job: &ClaimedJob, tool: &str) {
        // Steps that have not started when the job is cancelled never start.
        if job.cancel.is_cancelled() {
            debug!(job_id = %job.id, tool, "skipping step after cancellation");
            return;
        }

        let logs = &job.runtime.logs;
        let started_at = Utc::now();
        let (exit_code, step_error) = match self.catalog.get(tool) {
            Some(spec) => {
                logs.system(format!("[{tool}] starting"));
                let outcome = match &spec.kind {
                    StepKind::Command { .. } => self.run_command_step(job, spec).await,
                    StepKind::CertificateTransparency => self.run_crtsh_step(job, spec).await,
                };
                self.register_output(job, spec).await;
                outcome
            }
            None => (None, Some(StepError::execution("tool is not in the catalog"))),
        };

        match &step_error {
            None => logs.system(format!("[{tool}] finished")),
            Some(step_error) => logs.system(step_error.clone().into_error(tool).to_string()),
        };
        debug!(job_id = %job.id, tool, ?exit_code, error = ?step_error, "step finished");

        let result = StepResult {
            tool: tool.to_string(),
            exit_code,
            error: step_error,
            started_at,
            finished_at: Utc::now().max(started_at),
        };
        if !self.registry.record_step(job.id, result) {
            warn!(job_id = %job.id, tool, "step result rejected by registry");
        }
    }

    async fn register_output(&self, job: &ClaimedJob, spec: &ToolSpec) {
        let artifacts = &job.runtime.artifacts;
        if let (Some(name), Some(path)) = (
            spec.output.file_name(),
            spec.output_path(&job.working_dir),
        ) {
            if path.exists() {
                if let Err(err) = artifacts.register(name, &path).await {
                    warn!(job_id = %job.id, artifact = name, error = %err, "artifact registration failed");
                }
            }
        }
        if let Err(err) = artifacts.refresh().await {
            warn!(job_id = %job.id, error = %err, "artifact scan failed");
        }
    }

    async fn run_command_step(
        &self,
        job: &ClaimedJob,
        spec: &ToolSpec,
    ) -> (Option<i32>, Option<StepError>) {
        let ctx = StepContext {
            target: &job.target,
            working_dir: &job.working_dir,
            options: job.step_options.get(&spec.id),
        };
        let line = match spec.command_line(&ctx) {
            Ok(Some(line)) => line,
            Ok(None) => return (None, Some(StepError::execution("not a command step"))),
            Err(err) => return (None, Some(err)),
        };

        let command = CommandSpec::new(line.program.clone(), &job.working_dir)
            .args(line.args)
            .envs(&self.settings.step_environment)
            .envs(&job.environment);

        let tee = match &spec.output {
            StepOutput::Stdout { file } => Some(LineWriter::spawn(
                job.working_dir.join(file),
                WriteMode::Truncate,
            )),
            _ => None,
        };
        let logs = &job.runtime.logs;
        let tool = spec.id.as_str();

        let outcome = self
            .runner
            .run(
                &command,
                |stream, text| {
                    logs.output(tool, text);
                    if stream == OutputStream::Stdout
                        && let Some(tee) = &tee
                    {
                        tee.send(text.to_string());
                    }
                },
                &job.cancel,
            )
            .await;
        if let Some(tee) = tee {
            tee.finish().await;
        }

        match outcome {
            Ok(ProcessOutcome::Exited { code: Some(0) }) => (Some(0), None),
            Ok(ProcessOutcome::Exited { code: Some(code) }) => (
                Some(code),
                Some(StepError::execution(format!("exited with status {code}"))),
            ),
            Ok(ProcessOutcome::Exited { code: None }) => {
                (None, Some(StepError::execution("terminated by signal")))
            }
            Ok(ProcessOutcome::TimedOut) => {
                (None, Some(StepError::timeout(self.settings.step_timeout)))
            }
            Ok(ProcessOutcome::Killed) => (None, Some(StepError::Cancelled)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => (
                None,
                Some(StepError::execution(format!(
                    "executable not found: {}",
                    line.program
                ))),
            ),
            Err(err) => (
                None,
                Some(StepError::execution(format!(
                    "failed to launch {}: {err}",
                    line.program
                ))),
            ),
        }
    }

    async fn run_crtsh_step(
        &self,
        job: &ClaimedJob,
        spec: &ToolSpec,
    ) -> (Option<i32>, Option<StepError>) {
        let Some(path) = spec.output_path(&job.working_dir) else {
            return (None, Some(StepError::execution("no output file declared")));
        };
        let logs = &job.runtime.logs;

        let lookup = crtsh::fetch_names(&self.http, &self.settings.crtsh_endpoint, &job.target);
        let result = tokio::select! {
            result = tokio::time::timeout(self.settings.step_timeout, lookup) => result,
            _ = job.cancel.cancelled() => return (None, Some(StepError::Cancelled)),
        };
        let (certificates, names) = match result {
            Ok(Ok(found)) => found,
            Ok(Err(err)) => {
                return (
                    None,
                    Some(StepError::execution(format!("crt.sh lookup failed: {err}"))),
                );
            }
            Err(_) => return (None, Some(StepError::timeout(self.settings.step_timeout))),
        };

        logs.output(
            &spec.id,
            format!(
                "crt.sh returned {certificates} certificate(s) covering {} name(s)",
                names.len()
            ),
        );
        for name in &names {
            logs.output(&spec.id, name.as_str());
        }

        let mut body = names.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        match tokio::fs::write(&path, body).await {
            Ok(()) => (None, None),
            Err(err) => (
                None,
                Some(StepError::execution(format!(
                    "unable to write {}: {err}",
                    path.display()
                ))),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;

    use super::*;

    fn assert_spawnable<F: Future + Send + 'static>(_: F) {}

    #[test]
    fn job_runs_can_be_spawned() {
        // Type-checked only: the worker slots hand `run` to `tokio::spawn`.
        let _ = |executor: Arc<JobExecutor>, job: ClaimedJob| {
            assert_spawnable(async move { executor.run(job).await })
        };
    }
}
