//! Job storage contract and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use queuectl_core::{
    DomainError, FailureOutcome, Job, JobId, JobState, JobStats, NewJob,
};

/// Job store abstraction.
///
/// Every mutation is a guarded transition of the job state machine in
/// `queuectl_core::job`; a call against a job in the wrong state fails with
/// [`JobStoreError::InvalidTransition`] and leaves the record untouched.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `pending` job.
    async fn enqueue(&self, new_job: NewJob) -> Result<JobId, JobStoreError>;

    /// Atomically move the oldest pending job to `processing` under a lease
    /// held by `owner`. Returns `None` when nothing is pending.
    async fn claim(&self, owner: &str, lease: Duration) -> Result<Option<Job>, JobStoreError>;

    /// processing → completed. Only the current lease holder `owner` may
    /// report; anyone else gets [`JobStoreError::LeaseLost`].
    async fn mark_completed(
        &self,
        id: &JobId,
        owner: &str,
        output: String,
    ) -> Result<(), JobStoreError>;

    /// processing → failed | dead, counting the attempt. Same ownership rule
    /// as [`JobStore::mark_completed`].
    async fn mark_failed(
        &self,
        id: &JobId,
        owner: &str,
        error: String,
    ) -> Result<FailureOutcome, JobStoreError>;

    /// failed → pending.
    async fn requeue(&self, id: &JobId) -> Result<(), JobStoreError>;

    /// dead → pending with a fresh retry budget. `NotFound` if the job is
    /// absent or not dead.
    async fn retry_dead(&self, id: &JobId) -> Result<(), JobStoreError>;

    /// Snapshot in insertion order, optionally filtered by state.
    async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, JobStoreError>;

    async fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError>;

    async fn get_state(&self, id: &JobId) -> Result<JobState, JobStoreError> {
        self.get(id)
            .await?
            .map(|job| job.state)
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))
    }

    /// Job counts grouped by state.
    async fn counts(&self) -> Result<JobStats, JobStoreError>;

    /// Extend the lease of a job still processing under `owner`.
    async fn renew_lease(&self, id: &JobId, owner: &str, lease: Duration)
    -> Result<(), JobStoreError>;

    /// Return every processing job whose lease expired before `now` to
    /// `pending`. Returns the reclaimed ids.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    /// The caller's lease was reclaimed and the job now belongs to someone else.
    #[error("lease lost: {0}")]
    LeaseLost(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Persistence(String),
}

impl JobStoreError {
    /// Transient storage failures; the operation may succeed if repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobStoreError::Persistence(_))
    }
}

impl From<DomainError> for JobStoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => JobStoreError::Validation(msg),
            other @ DomainError::InvalidTransition { .. } => {
                JobStoreError::InvalidTransition(other.to_string())
            }
            other @ DomainError::LeaseNotHeld { .. } => {
                JobStoreError::LeaseLost(other.to_string())
            }
        }
    }
}

/// `now + delay`, or `None` if the result is not representable.
pub(crate) fn deadline_after(now: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
}

pub(crate) fn lease_deadline(
    now: DateTime<Utc>,
    lease: Duration,
) -> Result<DateTime<Utc>, JobStoreError> {
    deadline_after(now, lease)
        .ok_or_else(|| JobStoreError::Validation(format!("lease of {lease:?} is out of range")))
}

#[derive(Debug, Default)]
struct Table {
    jobs: HashMap<JobId, Job>,
    /// Insertion order; jobs are never deleted.
    order: Vec<JobId>,
}

impl Table {
    fn job_mut(&mut self, id: &JobId) -> Result<&mut Job, JobStoreError> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))
    }

    fn ordered(&self) -> impl Iterator<Item = &Job> {
        self.order.iter().filter_map(|id| self.jobs.get(id))
    }
}

/// In-memory job store for tests/dev.
///
/// One write lock covers selection and mutation, so claims are exclusive.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    table: RwLock<Table>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Table>, JobStoreError> {
        self.table
            .read()
            .map_err(|_| JobStoreError::Persistence("job table lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Table>, JobStoreError> {
        self.table
            .write()
            .map_err(|_| JobStoreError::Persistence("job table lock poisoned".into()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, new_job: NewJob) -> Result<JobId, JobStoreError> {
        let job = new_job.into_job(Utc::now())?;
        let mut table = self.write()?;
        if table.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id.clone();
        table.order.push(id.clone());
        table.jobs.insert(id.clone(), job);
        Ok(id)
    }

    async fn claim(&self, owner: &str, lease: Duration) -> Result<Option<Job>, JobStoreError> {
        let now = Utc::now();
        let expires_at = lease_deadline(now, lease)?;
        let mut table = self.write()?;

        let Some(id) = table
            .ordered()
            .find(|job| job.state == JobState::Pending)
            .map(|job| job.id.clone())
        else {
            return Ok(None);
        };

        let job = table.job_mut(&id)?;
        job.claim(owner, expires_at, now)?;
        Ok(Some(job.clone()))
    }

    async fn mark_completed(
        &self,
        id: &JobId,
        owner: &str,
        output: String,
    ) -> Result<(), JobStoreError> {
        let mut table = self.write()?;
        table.job_mut(id)?.complete(owner, output, Utc::now())?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: &JobId,
        owner: &str,
        error: String,
    ) -> Result<FailureOutcome, JobStoreError> {
        let mut table = self.write()?;
        Ok(table.job_mut(id)?.fail(owner, error, Utc::now())?)
    }

    async fn requeue(&self, id: &JobId) -> Result<(), JobStoreError> {
        let mut table = self.write()?;
        table.job_mut(id)?.requeue(Utc::now())?;
        Ok(())
    }

    async fn retry_dead(&self, id: &JobId) -> Result<(), JobStoreError> {
        let mut table = self.write()?;
        match table.jobs.get_mut(id) {
            Some(job) if job.state == JobState::Dead => {
                job.revive(Utc::now())?;
                Ok(())
            }
            _ => Err(JobStoreError::NotFound(id.clone())),
        }
    }

    async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, JobStoreError> {
        let table = self.read()?;
        Ok(table
            .ordered()
            .filter(|job| state.is_none_or(|s| job.state == s))
            .cloned()
            .collect())
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(id).cloned())
    }

    async fn counts(&self) -> Result<JobStats, JobStoreError> {
        let table = self.read()?;
        let mut stats = JobStats::default();
        for job in table.jobs.values() {
            stats.record(job.state, 1);
        }
        Ok(stats)
    }

    async fn renew_lease(
        &self,
        id: &JobId,
        owner: &str,
        lease: Duration,
    ) -> Result<(), JobStoreError> {
        let now = Utc::now();
        let expires_at = lease_deadline(now, lease)?;
        let mut table = self.write()?;
        table.job_mut(id)?.renew_lease(owner, expires_at, now)?;
        Ok(())
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, JobStoreError> {
        let mut table = self.write()?;
        let expired: Vec<JobId> = table
            .ordered()
            .filter(|job| job.lease_expired(now))
            .map(|job| job.id.clone())
            .collect();

        for id in &expired {
            table.job_mut(id)?.reclaim(now)?;
        }
        Ok(expired)
    }
}
