//! Worker loop: claim, execute, record, schedule retries.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use queuectl_core::{BackoffPolicy, FailureDecision, Job, JobId};

use super::executor::{CommandExecutor, ExecutionFailure};
use super::store::{JobStore, JobStoreError};

const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Worker runtime configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long to sleep when no job is pending (and between store retries).
    pub poll_interval: Duration,
    /// Lease taken on each claim; renewed every third of it while running.
    pub lease_duration: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            lease_duration: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    fn heartbeat_period(&self) -> Duration {
        (self.lease_duration / 3).max(MIN_HEARTBEAT)
    }
}

/// Outcome of one [`WorkerLoop::run_once`] iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// Nothing was pending.
    Idle,
    Completed(JobId),
    /// Failed with budget left; a requeue is scheduled after `delay`.
    Retrying { job_id: JobId, delay: Duration },
    /// Failed with the budget exhausted; now in the dead-letter queue.
    Dead(JobId),
    /// The lease was reclaimed before a result could be recorded; the job
    /// belongs to someone else now and nothing was written.
    Abandoned(JobId),
}

/// Per-worker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_abandoned: u64,
}

impl WorkerStats {
    pub fn merge(&mut self, other: WorkerStats) {
        self.jobs_processed += other.jobs_processed;
        self.jobs_succeeded += other.jobs_succeeded;
        self.jobs_failed += other.jobs_failed;
        self.jobs_dead_lettered += other.jobs_dead_lettered;
        self.jobs_abandoned += other.jobs_abandoned;
    }
}

/// A single sequential worker.
///
/// Backoff waits never block the loop: each retry is a timer task in the
/// worker's own `JoinSet`, aborted when the worker stops.
pub struct WorkerLoop<S, E> {
    id: String,
    store: Arc<S>,
    executor: Arc<E>,
    backoff: BackoffPolicy,
    config: WorkerConfig,
    timers: JoinSet<()>,
    shutdown: Option<watch::Receiver<bool>>,
    stats: WorkerStats,
}

impl<S, E> WorkerLoop<S, E>
where
    S: JobStore + 'static,
    E: CommandExecutor + 'static,
{
    pub fn new(
        id: impl Into<String>,
        store: Arc<S>,
        executor: Arc<E>,
        backoff: BackoffPolicy,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: id.into(),
            store,
            executor,
            backoff,
            config,
            timers: JoinSet::new(),
            shutdown: None,
            stats: WorkerStats::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// An in-flight command is always allowed to finish; pending requeue
    /// timers are aborted.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> WorkerStats {
        self.shutdown = Some(shutdown);
        info!(worker = %self.id, "worker started");

        while !self.is_shutting_down() {
            match self.run_once().await {
                Ok(Tick::Idle) => self.pause(self.config.poll_interval).await,
                Ok(_) => {}
                Err(JobStoreError::InvalidTransition(reason)) => {
                    error!(worker = %self.id, error = %reason, "job state changed underneath worker");
                }
                Err(err) => {
                    warn!(worker = %self.id, error = %err, "store call failed; pausing");
                    self.pause(self.config.poll_interval).await;
                }
            }
        }

        let abandoned = self.timers.len();
        self.timers.shutdown().await;
        info!(worker = %self.id, abandoned_retries = abandoned, "worker stopped");
        self.stats
    }

    /// Claim and process at most one job.
    pub async fn run_once(&mut self) -> Result<Tick, JobStoreError> {
        self.reap_timers();

        let lease = self.config.lease_duration;
        let Some(job) = self.store.claim(&self.id, lease).await? else {
            return Ok(Tick::Idle);
        };

        info!(
            worker = %self.id,
            job_id = %job.id,
            attempts = job.attempts,
            command = %job.command,
            "claimed job"
        );

        let execution = execute_with_heartbeat(
            self.store.as_ref(),
            self.executor.as_ref(),
            &self.id,
            &self.config,
            &job,
        )
        .await;
        let result = match execution {
            Execution::Finished(result) => result,
            Execution::LeaseLost(err) => return Ok(self.abandon(job.id, &err)),
        };
        self.stats.jobs_processed += 1;

        match result {
            Ok(output) => {
                let id = job.id.clone();
                let owner = self.id.clone();
                let recorded = self
                    .with_store_retry("mark_completed", &job.id, |store| {
                        let id = id.clone();
                        let owner = owner.clone();
                        let output = output.clone();
                        async move { store.mark_completed(&id, &owner, output).await }
                    })
                    .await;
                match recorded {
                    Ok(()) => {}
                    Err(err) if lease_lost(&err) => return Ok(self.abandon(job.id, &err)),
                    Err(err) => return Err(err),
                }

                self.stats.jobs_succeeded += 1;
                info!(worker = %self.id, job_id = %job.id, "job completed");
                Ok(Tick::Completed(job.id))
            }
            Err(failure) => self.record_failure(job, failure).await,
        }
    }

    async fn record_failure(
        &mut self,
        job: Job,
        failure: ExecutionFailure,
    ) -> Result<Tick, JobStoreError> {
        let reason = failure.describe();
        let id = job.id.clone();
        let owner = self.id.clone();
        let recorded = self
            .with_store_retry("mark_failed", &job.id, |store| {
                let id = id.clone();
                let owner = owner.clone();
                let reason = reason.clone();
                async move { store.mark_failed(&id, &owner, reason).await }
            })
            .await;
        let outcome = match recorded {
            Ok(outcome) => outcome,
            Err(err) if lease_lost(&err) => return Ok(self.abandon(job.id, &err)),
            Err(err) => return Err(err),
        };

        self.stats.jobs_failed += 1;

        match outcome.decision {
            FailureDecision::Dead => {
                self.stats.jobs_dead_lettered += 1;
                warn!(
                    worker = %self.id,
                    job_id = %job.id,
                    attempts = outcome.attempts,
                    error = %reason,
                    "retries exhausted; moved to dead-letter queue"
                );
                Ok(Tick::Dead(job.id))
            }
            FailureDecision::Retry => {
                let delay = self.backoff.delay(outcome.attempts);
                warn!(
                    worker = %self.id,
                    job_id = %job.id,
                    attempts = outcome.attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %reason,
                    "job failed; retry scheduled"
                );
                self.schedule_requeue(job.id.clone(), delay);
                Ok(Tick::Retrying {
                    job_id: job.id,
                    delay,
                })
            }
        }
    }

    fn abandon(&mut self, id: JobId, err: &JobStoreError) -> Tick {
        self.stats.jobs_abandoned += 1;
        warn!(worker = %self.id, job_id = %id, error = %err, "lease lost; result discarded");
        Tick::Abandoned(id)
    }

    fn schedule_requeue(&mut self, id: JobId, delay: Duration) {
        let store = Arc::clone(&self.store);
        let worker = self.id.clone();
        let retry_pause = self.config.poll_interval;

        self.timers.spawn(async move {
            tokio::time::sleep(delay).await;
            loop {
                match store.requeue(&id).await {
                    Ok(()) => {
                        debug!(worker = %worker, job_id = %id, "job requeued");
                        return;
                    }
                    Err(err) if err.is_retryable() => {
                        warn!(worker = %worker, job_id = %id, error = %err, "requeue failed; retrying");
                        tokio::time::sleep(retry_pause).await;
                    }
                    Err(err) => {
                        // already requeued by the reaper, or revived by hand
                        debug!(worker = %worker, job_id = %id, error = %err, "requeue skipped");
                        return;
                    }
                }
            }
        });
    }

    fn reap_timers(&mut self) {
        while let Some(done) = self.timers.try_join_next() {
            if let Err(err) = done {
                if err.is_panic() {
                    error!(worker = %self.id, error = %err, "requeue timer panicked");
                }
            }
        }
    }

    /// Repeat a store call while it fails with a transient error, pausing
    /// `poll_interval` between attempts. Gives up only on shutdown.
    async fn with_store_retry<T, F, Fut>(
        &mut self,
        operation: &'static str,
        job_id: &JobId,
        mut call: F,
    ) -> Result<T, JobStoreError>
    where
        F: FnMut(Arc<S>) -> Fut,
        Fut: Future<Output = Result<T, JobStoreError>>,
    {
        loop {
            match call(Arc::clone(&self.store)).await {
                Err(err) if err.is_retryable() && !self.is_shutting_down() => {
                    warn!(
                        worker = %self.id,
                        job_id = %job_id,
                        operation,
                        error = %err,
                        "store unavailable; retrying"
                    );
                    self.pause(self.config.poll_interval).await;
                }
                other => return other,
            }
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|rx| *rx.borrow() || rx.has_changed().is_err())
    }

    /// Sleep for `duration`, waking early on shutdown.
    async fn pause(&mut self, duration: Duration) {
        match self.shutdown.as_mut() {
            Some(rx) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {}
                    _ = rx.changed() => {}
                }
            }
            None => tokio::time::sleep(duration).await,
        }
    }
}

/// For a job this worker claimed, either error means the claim is gone:
/// the job was reclaimed (no longer processing) or re-claimed elsewhere.
fn lease_lost(err: &JobStoreError) -> bool {
    matches!(
        err,
        JobStoreError::LeaseLost(_) | JobStoreError::InvalidTransition(_)
    )
}

enum Execution {
    Finished(Result<String, ExecutionFailure>),
    /// Renewal was refused; the command future was dropped mid-run.
    LeaseLost(JobStoreError),
}

/// Run the command, renewing the lease until it finishes.
///
/// Stops early once the store refuses a renewal. Dropping the executor future
/// kills the shell through `kill_on_drop`.
async fn execute_with_heartbeat<S, E>(
    store: &S,
    executor: &E,
    worker: &str,
    config: &WorkerConfig,
    job: &Job,
) -> Execution
where
    S: JobStore + ?Sized,
    E: CommandExecutor + ?Sized,
{
    let run = executor.run(&job.command);
    tokio::pin!(run);

    let mut heartbeat = tokio::time::interval(config.heartbeat_period());
    // first tick is immediate; the claim just set the lease
    heartbeat.tick().await;

    loop {
        tokio::select! {
            result = &mut run => return Execution::Finished(result),
            _ = heartbeat.tick() => {
                match store.renew_lease(&job.id, worker, config.lease_duration).await {
                    Ok(()) => {}
                    Err(err) if lease_lost(&err) => return Execution::LeaseLost(err),
                    Err(err) => {
                        warn!(worker, job_id = %job.id, error = %err, "lease renewal failed");
                    }
                }
            }
        }
    }
}
