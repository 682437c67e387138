//! Runs N workers plus a lease reaper over one shared store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use queuectl_core::{BackoffPolicy, JobId, JobState};

use super::executor::CommandExecutor;
use super::store::{JobStore, JobStoreError, deadline_after};
use super::worker::{WorkerConfig, WorkerLoop, WorkerStats};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub workers: usize,
    /// How often the reaper scans for expired leases and lost retries.
    pub reap_interval: Duration,
    pub backoff: BackoffPolicy,
    pub worker: WorkerConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            reap_interval: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_reap_interval(mut self, reap_interval: Duration) -> Self {
        self.reap_interval = reap_interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_worker_config(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }
}

/// Handle to control and join a running supervisor.
#[derive(Debug)]
pub struct SupervisorHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<(String, JoinHandle<WorkerStats>)>,
    reaper: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn worker_ids(&self) -> impl Iterator<Item = &str> {
        self.workers.iter().map(|(id, _)| id.as_str())
    }

    /// Ask every task to stop after its current job.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Request graceful shutdown and wait for all tasks to stop.
    pub async fn shutdown(self) -> WorkerStats {
        self.request_shutdown();
        self.wait().await
    }

    /// Wait for all tasks to stop; returns the combined worker counters.
    pub async fn wait(self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for (id, handle) in self.workers {
            match handle.await {
                Ok(stats) => total.merge(stats),
                Err(err) => error!(worker = %id, error = %err, "worker task failed"),
            }
        }
        if let Err(err) = self.reaper.await {
            error!(error = %err, "reaper task failed");
        }
        total
    }
}

/// Spawns and owns the worker tasks.
#[derive(Debug)]
pub struct Supervisor;

impl Supervisor {
    /// Start `config.workers` workers and the reaper on the current runtime.
    ///
    /// Worker ids are `<pid>-worker-<n>` so lease owners stay unique across
    /// processes sharing one database file.
    pub fn spawn<S, E>(store: Arc<S>, executor: Arc<E>, config: SupervisorConfig) -> SupervisorHandle
    where
        S: JobStore + 'static,
        E: CommandExecutor + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pid = std::process::id();
        let count = config.workers.max(1);
        if config.workers == 0 {
            warn!("worker count of 0 requested; starting 1 worker");
        }

        let workers = (1..=count)
            .map(|n| {
                let id = format!("{pid}-worker-{n}");
                let worker = WorkerLoop::new(
                    id.clone(),
                    Arc::clone(&store),
                    Arc::clone(&executor),
                    config.backoff,
                    config.worker.clone(),
                );
                (id, tokio::spawn(worker.run(shutdown_rx.clone())))
            })
            .collect();

        let reaper = tokio::spawn(reap_loop(
            store,
            config.backoff,
            config.worker.lease_duration,
            config.reap_interval,
            shutdown_rx,
        ));

        info!(workers = count, "supervisor started");
        SupervisorHandle {
            shutdown: shutdown_tx,
            workers,
            reaper,
        }
    }
}

/// What one reaper pass recovered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Processing jobs whose lease expired.
    pub reclaimed: Vec<JobId>,
    /// Failed jobs whose requeue timer was lost.
    pub requeued: Vec<JobId>,
}

/// One reaper pass.
///
/// A failed job counts as orphaned once `updated_at + delay(attempts) + grace`
/// has passed; `grace` gives a live worker's timer the first chance.
pub async fn reap_once<S>(
    store: &S,
    backoff: BackoffPolicy,
    grace: Duration,
    now: DateTime<Utc>,
) -> Result<ReapReport, JobStoreError>
where
    S: JobStore + ?Sized,
{
    let reclaimed = store.reclaim_expired(now).await?;

    let mut requeued = Vec::new();
    for job in store.list(Some(JobState::Failed)).await? {
        let wait = backoff.delay(job.attempts).saturating_add(grace);
        let overdue = deadline_after(job.updated_at, wait).is_some_and(|due| due <= now);
        if !overdue {
            continue;
        }
        match store.requeue(&job.id).await {
            Ok(()) => requeued.push(job.id),
            Err(JobStoreError::InvalidTransition(_)) => {}
            Err(err) => return Err(err),
        }
    }

    Ok(ReapReport {
        reclaimed,
        requeued,
    })
}

async fn reap_loop<S: JobStore>(
    store: Arc<S>,
    backoff: BackoffPolicy,
    grace: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        match reap_once(store.as_ref(), backoff, grace, Utc::now()).await {
            Ok(report) => {
                for id in &report.reclaimed {
                    warn!(job_id = %id, "lease expired; job returned to pending");
                }
                for id in &report.requeued {
                    info!(job_id = %id, "requeued failed job with lost retry timer");
                }
            }
            Err(err) => warn!(error = %err, "reaper pass failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() || shutdown.has_changed().is_err() {
            break;
        }
    }
}
