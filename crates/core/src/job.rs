//! The job record and its persisted state machine.
//!
//! ```text
//! pending ──claim──▶ processing ──complete──▶ completed
//!    ▲                   │
//!    │                   ├──fail (attempts ≤ max_retries)──▶ failed ──requeue──▶ pending
//!    │                   ├──fail (attempts > max_retries)──▶ dead ──revive──▶ pending
//!    └──lease expired────┘
//! ```
//!
//! Every transition is a method on [`Job`] that checks the prior state and
//! returns [`DomainError::InvalidTransition`] otherwise. Stores apply these
//! methods under their own atomicity guarantees; nothing here does I/O.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};

/// Retry budget used when neither the job nor the configuration names one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Unique job identifier, either client-supplied or generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh, time-ordered identifier (`job-<uuidv7>`).
    pub fn generate() -> Self {
        Self(format!("job-{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("job id must not be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Persisted job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    /// `completed` and `dead` are terminal (dead only until revived).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                DomainError::validation(format!(
                    "unknown job state '{s}' (expected one of pending, processing, completed, failed, dead)"
                ))
            })
    }
}

/// Enqueue input as accepted from clients (JSON).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl NewJob {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Fill in the retry budget from configuration when the client left it out.
    pub fn or_max_retries(mut self, default: u32) -> Self {
        self.max_retries.get_or_insert(default);
        self
    }

    /// Parse a JSON enqueue request.
    pub fn from_json(input: &str) -> DomainResult<Self> {
        serde_json::from_str(input)
            .map_err(|e| DomainError::validation(format!("malformed job JSON: {e}")))
    }

    /// Validate and build the initial `pending` record.
    pub fn into_job(self, now: DateTime<Utc>) -> DomainResult<Job> {
        if self.command.trim().is_empty() {
            return Err(DomainError::validation("command must not be empty"));
        }
        let id = match self.id {
            Some(id) => id.parse::<JobId>()?,
            None => JobId::generate(),
        };
        Ok(Job {
            id,
            command: self.command,
            state: JobState::Pending,
            attempts: 0,
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            created_at: now,
            updated_at: now,
            run_at: now,
            last_error: None,
            output: None,
            lease_owner: None,
            lease_expires_at: None,
        })
    }
}

/// A queued shell-command job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub state: JobState,
    /// Failed executions so far.
    pub attempts: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the job last became eligible for claiming.
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub output: Option<String>,
    /// Worker holding the claim while `processing`.
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// What happened to a job after a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureDecision {
    /// Budget remains; the job sits in `failed` until requeued.
    Retry,
    /// Budget exhausted; the job is in the dead-letter queue.
    Dead,
}

/// Result of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureOutcome {
    pub decision: FailureDecision,
    pub attempts: u32,
}

impl Job {
    fn expect_state(&self, action: &'static str, expected: JobState) -> DomainResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(
                self.id.clone(),
                action,
                expected,
                self.state,
            ))
        }
    }

    fn expect_holder(&self, action: &'static str, owner: &str) -> DomainResult<()> {
        self.expect_state(action, JobState::Processing)?;
        if self.lease_owner.as_deref() != Some(owner) {
            return Err(DomainError::LeaseNotHeld {
                job_id: self.id.clone(),
                owner: owner.to_string(),
            });
        }
        Ok(())
    }

    fn release_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }

    /// pending → processing, held by `owner` until `lease_expires_at`.
    pub fn claim(
        &mut self,
        owner: &str,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.expect_state("claim", JobState::Pending)?;
        self.state = JobState::Processing;
        self.lease_owner = Some(owner.to_string());
        self.lease_expires_at = Some(lease_expires_at);
        self.updated_at = now;
        Ok(())
    }

    /// processing → completed, reported by the lease holder.
    pub fn complete(
        &mut self,
        owner: &str,
        output: String,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.expect_holder("complete", owner)?;
        self.state = JobState::Completed;
        self.output = Some(output);
        self.updated_at = now;
        self.release_lease();
        Ok(())
    }

    /// processing → failed | dead, reported by the lease holder. Counts the attempt.
    pub fn fail(
        &mut self,
        owner: &str,
        error: String,
        now: DateTime<Utc>,
    ) -> DomainResult<FailureOutcome> {
        self.expect_holder("fail", owner)?;
        self.attempts = self.attempts.saturating_add(1);
        self.last_error = Some(error);
        self.updated_at = now;
        self.release_lease();

        let decision = if self.attempts > self.max_retries {
            self.state = JobState::Dead;
            FailureDecision::Dead
        } else {
            self.state = JobState::Failed;
            FailureDecision::Retry
        };

        Ok(FailureOutcome {
            decision,
            attempts: self.attempts,
        })
    }

    /// failed → pending, once the backoff delay has elapsed.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_state("requeue", JobState::Failed)?;
        self.state = JobState::Pending;
        self.updated_at = now;
        self.run_at = now;
        Ok(())
    }

    /// dead → pending with a fresh retry budget.
    pub fn revive(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_state("revive", JobState::Dead)?;
        self.state = JobState::Pending;
        self.attempts = 0;
        self.last_error = None;
        self.updated_at = now;
        self.run_at = now;
        Ok(())
    }

    /// Extend the lease of a job still held by `owner`.
    pub fn renew_lease(
        &mut self,
        owner: &str,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.expect_holder("renew lease", owner)?;
        self.lease_expires_at = Some(lease_expires_at);
        self.updated_at = now;
        Ok(())
    }

    /// Whether a `processing` job's lease ran out before `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Processing
            && self.lease_expires_at.is_some_and(|expires| expires < now)
    }

    /// processing → pending after the holder vanished. Attempts are untouched:
    /// the execution never reported a result.
    pub fn reclaim(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_state("reclaim", JobState::Processing)?;
        let owner = self.lease_owner.take().unwrap_or_default();
        self.lease_expires_at = None;
        self.state = JobState::Pending;
        self.last_error = Some(format!("lease held by '{owner}' expired"));
        self.updated_at = now;
        self.run_at = now;
        Ok(())
    }
}

/// Job counts grouped by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
}

impl JobStats {
    pub fn record(&mut self, state: JobState, count: u64) {
        let slot = match state {
            JobState::Pending => &mut self.pending,
            JobState::Processing => &mut self.processing,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            JobState::Dead => &mut self.dead,
        };
        *slot += count;
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.dead
    }
}
