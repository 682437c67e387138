//! Command implementations, kept apart from argument parsing so they can be
//! driven directly against any `JobStore`.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use tracing::info;

use queuectl_core::{JobId, JobState, NewJob, QueueConfig};
use queuectl_infra::jobs::{
    JobStore, JobStoreError, ShellExecutor, Supervisor, SupervisorConfig, WorkerConfig, WorkerStats,
};

use crate::config_file;

pub(crate) async fn enqueue<S: JobStore>(
    store: &S,
    config: &QueueConfig,
    input: &str,
) -> anyhow::Result<JobId> {
    let new_job = NewJob::from_json(input)?.or_max_retries(config.max_retries);
    let id = store.enqueue(new_job).await.context("failed to enqueue job")?;
    info!(job_id = %id, "job enqueued");
    Ok(id)
}

pub(crate) async fn status<S: JobStore>(store: &S) -> anyhow::Result<String> {
    let stats = store.counts().await.context("failed to read job counts")?;
    Ok(serde_json::to_string_pretty(&stats)?)
}

pub(crate) async fn list<S: JobStore>(store: &S, state: Option<JobState>) -> anyhow::Result<String> {
    let jobs = store.list(state).await.context("failed to list jobs")?;
    Ok(serde_json::to_string_pretty(&jobs)?)
}

pub(crate) async fn dlq_list<S: JobStore>(store: &S) -> anyhow::Result<String> {
    list(store, Some(JobState::Dead)).await
}

pub(crate) async fn dlq_retry<S: JobStore>(store: &S, id: &str) -> anyhow::Result<JobId> {
    let id: JobId = id.parse()?;
    match store.retry_dead(&id).await {
        Ok(()) => {
            info!(job_id = %id, "dead job moved back to pending");
            Ok(id)
        }
        Err(JobStoreError::NotFound(id)) => Err(anyhow!("no dead job with id '{id}'")),
        Err(err) => Err(anyhow::Error::new(err).context("failed to retry dead job")),
    }
}

pub(crate) fn config_show(path: &Path) -> anyhow::Result<String> {
    let config = config_file::load_or_init(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    Ok(config.to_json_pretty()?)
}

pub(crate) fn config_set(path: &Path, key: &str, value: &str) -> anyhow::Result<QueueConfig> {
    let mut config = config_file::load_or_init(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    config.set(key, value)?;
    config_file::save(path, &config)
        .with_context(|| format!("failed to save {}", path.display()))?;
    info!(key, value, "configuration updated");
    Ok(config)
}

/// Worker runtime knobs taken from the command line.
#[derive(Debug, Clone)]
pub(crate) struct WorkerOptions {
    pub count: usize,
    pub poll_interval: Duration,
    pub lease: Duration,
    pub command_timeout: Option<Duration>,
}

/// Run a supervisor until `shutdown` resolves, then stop it gracefully.
pub(crate) async fn run_workers<S, F>(
    store: Arc<S>,
    config: &QueueConfig,
    options: WorkerOptions,
    shutdown: F,
) -> WorkerStats
where
    S: JobStore + 'static,
    F: Future<Output = ()>,
{
    let executor = match options.command_timeout {
        Some(limit) => ShellExecutor::new().with_timeout(limit),
        None => ShellExecutor::new(),
    };
    let supervisor_config = SupervisorConfig::default()
        .with_workers(options.count)
        .with_backoff(config.backoff())
        .with_worker_config(
            WorkerConfig::default()
                .with_poll_interval(options.poll_interval)
                .with_lease_duration(options.lease),
        );

    let handle = Supervisor::spawn(store, Arc::new(executor), supervisor_config);
    shutdown.await;
    info!("shutdown requested; waiting for running jobs to finish");
    let stats = handle.shutdown().await;
    info!(
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        failed = stats.jobs_failed,
        dead = stats.jobs_dead_lettered,
        abandoned = stats.jobs_abandoned,
        "workers stopped"
    );
    stats
}
