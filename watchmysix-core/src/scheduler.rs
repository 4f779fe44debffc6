//! Worker slots.
//!
//! Exactly `max_concurrency` slots run as tasks. Each one claims the head of
//! the registry queue, runs it to a terminal state, then immediately claims
//! again; with nothing queued it parks on the registry's work signal.

use std::sync::Arc;

use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info};

use crate::job::{JobExecutor, JobRegistry};

#[derive(Debug)]
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(slots: usize, registry: Arc<JobRegistry>, executor: Arc<JobExecutor>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let workers = (0..slots)
            .map(|slot| {
                tokio::spawn(worker_loop(
                    slot,
                    Arc::clone(&registry),
                    Arc::clone(&executor),
                    shutdown.subscribe(),
                ))
            })
            .collect();
        info!(slots, "worker pool started");
        Self { shutdown, workers }
    }

    pub fn slots(&self) -> usize {
        self.workers.len()
    }

    /// Stop claiming new jobs and wait for in-flight jobs to wind down.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(err) = worker.await {
                error!(error = %err, "worker slot exited abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

async fn worker_loop(
    slot: usize,
    registry: Arc<JobRegistry>,
    executor: Arc<JobExecutor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let signal = registry.work_signal();
    debug!(slot, "worker slot ready");

    loop {
        if *shutdown.borrow() {
            break;
        }

        // Register interest before checking the queue so a submission that
        // lands in between still wakes this slot.
        let notified = signal.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(job) = registry.claim_next() {
            let job_id = job.id;
            debug!(slot, %job_id, "slot claimed job");

            let run = tokio::spawn({
                let executor = Arc::clone(&executor);
                async move { executor.run(job).await }
            });
            match run.await {
                Ok(status) => debug!(slot, %job_id, %status, "slot released"),
                Err(err) => {
                    error!(slot, %job_id, error = %err, "job execution aborted");
                    if let Err(err) = registry.fail(job_id, "job execution aborted") {
                        debug!(%job_id, error = %err, "job already terminal after abort");
                    }
                }
            }
            continue;
        }

        tokio::select! {
            _ = &mut notified => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!(slot, "worker slot stopped");
}
