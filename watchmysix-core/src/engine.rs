//! The engine facade consumed by the HTTP layer.

use std::sync::Arc;

use tokio::{fs::File, sync::Mutex};
use tracing::{info, warn};

use crate::{
    artifacts::Artifact,
    error::Result,
    ids::JobId,
    job::{
        CancelOutcome, JobExecutor, JobRegistry, JobRequest, JobRuntime, JobSnapshot, JobStatus,
        JobSummary,
    },
    logs::{LogEntry, LogStream},
    persistence,
    scheduler::WorkerPool,
    settings::EngineSettings,
    tools::ToolCatalog,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct EngineStats {
    pub max_concurrency: usize,
    pub running: usize,
    pub queued: usize,
}

#[derive(Debug)]
pub struct ReconEngine {
    settings: Arc<EngineSettings>,
    catalog: Arc<ToolCatalog>,
    registry: Arc<JobRegistry>,
    pool: Mutex<Option<WorkerPool>>,
}

impl ReconEngine {
    /// Rehydrate persisted jobs and start the worker slots.
    pub async fn start(settings: EngineSettings, catalog: ToolCatalog) -> Result<Arc<Self>> {
        settings.validate()?;
        tokio::fs::create_dir_all(settings.jobs_root()).await?;

        let settings = Arc::new(settings);
        let catalog = Arc::new(catalog);
        let registry = Arc::new(JobRegistry::new(Arc::clone(&settings), Arc::clone(&catalog)));

        if settings.persist {
            Self::rehydrate(&settings, &registry).await?;
        }

        let executor = Arc::new(JobExecutor::new(
            Arc::clone(&settings),
            Arc::clone(&catalog),
            Arc::clone(&registry),
        )?);
        let pool = WorkerPool::spawn(settings.max_concurrency, Arc::clone(&registry), executor);

        info!(
            data_root = %settings.data_root.display(),
            max_concurrency = settings.max_concurrency,
            tools = catalog.len(),
            "recon engine started"
        );
        Ok(Arc::new(Self {
            settings,
            catalog,
            registry,
            pool: Mutex::new(Some(pool)),
        }))
    }

    async fn rehydrate(settings: &EngineSettings, registry: &JobRegistry) -> Result<()> {
        let persisted = persistence::load_jobs(&settings.jobs_root()).await?;
        let mut interrupted = 0;
        let total = persisted.len();

        for job in persisted {
            let was_terminal = job.snapshot.status.is_terminal();
            let Some((snapshot, runtime)) = registry.restore(job.snapshot, job.log_lines) else {
                continue;
            };
            if let Err(err) = runtime.artifacts.refresh().await {
                warn!(job_id = %snapshot.id, error = %err, "artifact scan of restored job failed");
            }
            if !was_terminal {
                interrupted += 1;
                if let Err(err) = persistence::write_snapshot(&snapshot).await {
                    warn!(job_id = %snapshot.id, error = %err, "failed to persist interrupted job");
                }
            }
        }

        if total > 0 {
            info!(restored = total, interrupted, "restored persisted jobs");
        }
        Ok(())
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn submit(&self, request: JobRequest) -> Result<JobId> {
        self.registry.submit(request)
    }

    pub fn get(&self, id: JobId) -> Result<JobSnapshot> {
        self.registry.get(id)
    }

    pub fn list(&self) -> Vec<JobSummary> {
        self.registry.list()
    }

    pub fn cancel(&self, id: JobId) -> Result<CancelOutcome> {
        self.registry.cancel(id)
    }

    pub fn subscribe(&self, id: JobId, from: Option<u64>) -> Result<LogStream> {
        Ok(self.registry.runtime(id)?.logs.subscribe(from))
    }

    pub fn log_snapshot(&self, id: JobId, from: Option<u64>) -> Result<Vec<LogEntry>> {
        Ok(self.registry.runtime(id)?.logs.snapshot(from))
    }

    pub async fn artifacts(&self, id: JobId) -> Result<Vec<Artifact>> {
        let runtime = self.fresh_runtime(id).await?;
        Ok(runtime.artifacts.list())
    }

    pub async fn open_artifact(&self, id: JobId, name: &str) -> Result<(Artifact, File)> {
        let runtime = self.fresh_runtime(id).await?;
        runtime.artifacts.open(name).await
    }

    /// A rewound temporary file holding the job's ZIP bundle.
    pub async fn archive(&self, id: JobId) -> Result<File> {
        let runtime = self.fresh_runtime(id).await?;
        runtime.artifacts.archive().await
    }

    /// Running jobs may have written files since the last step finished.
    async fn fresh_runtime(&self, id: JobId) -> Result<Arc<JobRuntime>> {
        let runtime = self.registry.runtime(id)?;
        if self.registry.get(id)?.status == JobStatus::Running {
            runtime.artifacts.refresh().await?;
        }
        Ok(runtime)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            max_concurrency: self.settings.max_concurrency,
            running: self.registry.running_count(),
            queued: self.registry.queued_count(),
        }
    }

    /// Refuse new work, cancel queued and running jobs and wait for the
    /// slots to exit.
    pub async fn shutdown(&self) {
        let dequeued = self.registry.close_intake();
        let cancelled = self.registry.cancel_running();
        if let Some(pool) = self.pool.lock().await.take() {
            info!(dequeued, cancelled, slots = pool.slots(), "shutting down recon engine");
            pool.shutdown().await;
        }
    }
}
