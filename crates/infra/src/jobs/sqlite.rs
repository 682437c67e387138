//! SQLite-backed job store.
//!
//! Schema (`jobs`):
//!
//! ```text
//! id TEXT PRIMARY KEY, command TEXT, state TEXT CHECK(...), attempts INTEGER,
//! max_retries INTEGER, created_at/updated_at/run_at TEXT, last_error TEXT NULL,
//! output TEXT NULL, lease_owner TEXT NULL, lease_expires_at TEXT NULL
//! ```
//!
//! Timestamps are fixed-width RFC 3339 UTC strings (millisecond precision), so
//! lexical order equals chronological order inside SQL comparisons.
//!
//! Claim is a single conditional `UPDATE ... RETURNING`. Every other mutation
//! loads the row, applies the pure transition from `queuectl_core::job`, and
//! writes it back with a compare-and-swap keyed by
//! `(id, state, attempts, lease_owner)`. A lost race surfaces as
//! [`JobStoreError::InvalidTransition`].

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use queuectl_core::{DomainResult, FailureOutcome, Job, JobId, JobState, JobStats, NewJob};

use super::store::{JobStore, JobStoreError, lease_deadline};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id                TEXT PRIMARY KEY,
    command           TEXT NOT NULL,
    state             TEXT NOT NULL
                      CHECK (state IN ('pending', 'processing', 'completed', 'failed', 'dead')),
    attempts          INTEGER NOT NULL DEFAULT 0,
    max_retries       INTEGER NOT NULL,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,
    run_at            TEXT NOT NULL,
    last_error        TEXT NULL,
    output            TEXT NULL,
    lease_owner       TEXT NULL,
    lease_expires_at  TEXT NULL
)
"#;

const CREATE_STATE_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs (state)";

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, created_at, updated_at, \
                           run_at, last_error, output, lease_owner, lease_expires_at";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable job store over a SQLite database file.
///
/// Cheap to clone; all clones share one connection pool. Several processes
/// may open the same file: claims stay exclusive because SQLite serializes
/// writers.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (creating if needed) the database at `path` and ensure the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, JobStoreError> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("open", e))?;

        debug!(path = %path.display(), "opened sqlite job store");
        Self::from_pool(pool).await
    }

    /// A private in-memory database (tests, benchmarks).
    ///
    /// Pinned to a single connection that never expires, since every SQLite
    /// memory connection is its own database.
    pub async fn in_memory() -> Result<Self, JobStoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| map_sqlx_error("open", e))?;
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("open", e))?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and create the schema if missing.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, JobStoreError> {
        sqlx::query(CREATE_TABLE)
            .execute(&pool)
            .await
            .map_err(|e| map_sqlx_error("create_table", e))?;
        sqlx::query(CREATE_STATE_INDEX)
            .execute(&pool)
            .await
            .map_err(|e| map_sqlx_error("create_index", e))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(row_to_job).transpose()
    }

    /// Load, apply `apply`, and compare-and-swap the row back.
    async fn transition<T, F>(
        &self,
        id: &JobId,
        operation: &'static str,
        apply: F,
    ) -> Result<T, JobStoreError>
    where
        T: Send,
        F: FnOnce(&mut Job) -> DomainResult<T> + Send,
    {
        let mut job = self
            .fetch(id)
            .await?
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))?;
        let expected = Expected::of(&job);

        let value = apply(&mut job)?;
        self.compare_and_swap(&job, &expected, operation).await?;
        Ok(value)
    }

    async fn compare_and_swap(
        &self,
        job: &Job,
        expected: &Expected,
        operation: &'static str,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?1,
                attempts = ?2,
                updated_at = ?3,
                run_at = ?4,
                last_error = ?5,
                output = ?6,
                lease_owner = ?7,
                lease_expires_at = ?8
            WHERE id = ?9 AND state = ?10 AND attempts = ?11 AND lease_owner IS ?12
            "#,
        )
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts))
        .bind(ts(job.updated_at))
        .bind(ts(job.run_at))
        .bind(job.last_error.as_deref())
        .bind(job.output.as_deref())
        .bind(job.lease_owner.as_deref())
        .bind(job.lease_expires_at.map(ts))
        .bind(job.id.as_str())
        .bind(expected.state.as_str())
        .bind(i64::from(expected.attempts))
        .bind(expected.lease_owner.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::InvalidTransition(format!(
                "job {} changed concurrently during {operation}",
                job.id
            )));
        }
        Ok(())
    }
}

/// Row version a write-back is conditioned on.
#[derive(Debug)]
struct Expected {
    state: JobState,
    attempts: u32,
    lease_owner: Option<String>,
}

impl Expected {
    fn of(job: &Job) -> Self {
        Self {
            state: job.state,
            attempts: job.attempts,
            lease_owner: job.lease_owner.clone(),
        }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, new_job), fields(command = %new_job.command), err)]
    async fn enqueue(&self, new_job: NewJob) -> Result<JobId, JobStoreError> {
        let job = new_job.into_job(Utc::now())?;

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, command, state, attempts, max_retries,
                              created_at, updated_at, run_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(job.id.as_str())
        .bind(&job.command)
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_retries))
        .bind(ts(job.created_at))
        .bind(ts(job.updated_at))
        .bind(ts(job.run_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(job.id),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(JobStoreError::AlreadyExists(job.id))
            }
            Err(e) => Err(map_sqlx_error("enqueue", e)),
        }
    }

    #[instrument(skip(self), err)]
    async fn claim(&self, owner: &str, lease: Duration) -> Result<Option<Job>, JobStoreError> {
        let now = Utc::now();
        let expires_at = lease_deadline(now, lease)?;

        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'processing',
                lease_owner = ?1,
                lease_expires_at = ?2,
                updated_at = ?3
            WHERE id = (SELECT id FROM jobs WHERE state = 'pending' ORDER BY rowid LIMIT 1)
              AND state = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(owner)
            .bind(ts(expires_at))
            .bind(ts(now))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;

        row.as_ref().map(row_to_job).transpose()
    }

    #[instrument(skip(self, output), fields(job_id = %id), err)]
    async fn mark_completed(
        &self,
        id: &JobId,
        owner: &str,
        output: String,
    ) -> Result<(), JobStoreError> {
        self.transition(id, "mark_completed", |job| {
            job.complete(owner, output, Utc::now())
        })
        .await
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn mark_failed(
        &self,
        id: &JobId,
        owner: &str,
        error: String,
    ) -> Result<FailureOutcome, JobStoreError> {
        self.transition(id, "mark_failed", |job| job.fail(owner, error, Utc::now()))
            .await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn requeue(&self, id: &JobId) -> Result<(), JobStoreError> {
        self.transition(id, "requeue", |job| job.requeue(Utc::now()))
            .await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn retry_dead(&self, id: &JobId) -> Result<(), JobStoreError> {
        match self.fetch(id).await? {
            Some(job) if job.state == JobState::Dead => {
                self.transition(id, "retry_dead", |job| job.revive(Utc::now()))
                    .await
            }
            _ => Err(JobStoreError::NotFound(id.clone())),
        }
    }

    #[instrument(skip(self), err)]
    async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, JobStoreError> {
        let rows = match state {
            Some(state) => {
                let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE state = ?1 ORDER BY rowid");
                sqlx::query(&sql)
                    .bind(state.as_str())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let sql = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY rowid");
                sqlx::query(&sql).fetch_all(&self.pool).await
            }
        }
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(row_to_job).collect()
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        self.fetch(id).await
    }

    #[instrument(skip(self), err)]
    async fn counts(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("counts", e))?;

        let mut stats = JobStats::default();
        for row in &rows {
            let state: String = row.try_get("state").map_err(corrupt_row)?;
            let count: i64 = row.try_get("n").map_err(corrupt_row)?;
            let state = state
                .parse::<JobState>()
                .map_err(|e| JobStoreError::Persistence(format!("corrupt jobs row: {e}")))?;
            stats.record(state, u64::try_from(count).unwrap_or_default());
        }
        Ok(stats)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn renew_lease(
        &self,
        id: &JobId,
        owner: &str,
        lease: Duration,
    ) -> Result<(), JobStoreError> {
        let now = Utc::now();
        let expires_at = lease_deadline(now, lease)?;
        self.transition(id, "renew_lease", |job| {
            job.renew_lease(owner, expires_at, now)
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM jobs
            WHERE state = 'processing' AND lease_expires_at < ?1
            ORDER BY rowid
            "#,
        )
        .bind(ts(now))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("reclaim_expired", e))?;

        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.try_get("id").map_err(corrupt_row)?;
            let id = JobId::from(id);
            let outcome = self
                .transition(&id, "reclaim_expired", |job| {
                    if job.lease_expired(now) {
                        job.reclaim(now).map(|()| true)
                    } else {
                        Ok(false)
                    }
                })
                .await;

            match outcome {
                Ok(true) => reclaimed.push(id),
                // renewed, completed or failed since the scan
                Ok(false) | Err(JobStoreError::InvalidTransition(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(reclaimed)
    }
}

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(column: &str, value: &str) -> Result<DateTime<Utc>, JobStoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| JobStoreError::Persistence(format!("invalid {column} '{value}': {e}")))
}

fn corrupt_row(err: sqlx::Error) -> JobStoreError {
    JobStoreError::Persistence(format!("corrupt jobs row: {err}"))
}

fn row_to_job(row: &SqliteRow) -> Result<Job, JobStoreError> {
    let id: String = row.try_get("id").map_err(corrupt_row)?;
    let command: String = row.try_get("command").map_err(corrupt_row)?;

    let state_str: String = row.try_get("state").map_err(corrupt_row)?;
    let state = state_str
        .parse::<JobState>()
        .map_err(|e| JobStoreError::Persistence(format!("corrupt jobs row: {e}")))?;

    let attempts: i64 = row.try_get("attempts").map_err(corrupt_row)?;
    let max_retries: i64 = row.try_get("max_retries").map_err(corrupt_row)?;
    let to_u32 = |column: &str, value: i64| {
        u32::try_from(value).map_err(|_| {
            JobStoreError::Persistence(format!("{column} out of range in jobs row: {value}"))
        })
    };

    let created_at: String = row.try_get("created_at").map_err(corrupt_row)?;
    let updated_at: String = row.try_get("updated_at").map_err(corrupt_row)?;
    let run_at: String = row.try_get("run_at").map_err(corrupt_row)?;
    let lease_expires_at: Option<String> = row.try_get("lease_expires_at").map_err(corrupt_row)?;

    Ok(Job {
        id: JobId::from(id),
        command,
        state,
        attempts: to_u32("attempts", attempts)?,
        max_retries: to_u32("max_retries", max_retries)?,
        created_at: parse_ts("created_at", &created_at)?,
        updated_at: parse_ts("updated_at", &updated_at)?,
        run_at: parse_ts("run_at", &run_at)?,
        last_error: row.try_get("last_error").map_err(corrupt_row)?,
        output: row.try_get("output").map_err(corrupt_row)?,
        lease_owner: row.try_get("lease_owner").map_err(corrupt_row)?,
        lease_expires_at: lease_expires_at
            .as_deref()
            .map(|value| parse_ts("lease_expires_at", value))
            .transpose()?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Persistence(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Persistence(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Persistence(format!("connection pool timed out in {}", operation))
        }
        other => JobStoreError::Persistence(format!("sqlx error in {}: {}", operation, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::conformance;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn sqlite_store_conformance() {
        conformance::run_all(|| async { SqliteJobStore::in_memory().await.unwrap() }).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_are_exclusive_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobStore::open(dir.path().join("jobs.db")).await.unwrap();
        conformance::concurrent_claims_are_exclusive(Arc::new(store)).await;
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");

        let store = SqliteJobStore::open(&path).await.unwrap();
        let id = store
            .enqueue(NewJob::new("exit 1").with_max_retries(0))
            .await
            .unwrap();
        store.claim("w1", Duration::from_secs(30)).await.unwrap().unwrap();
        store.mark_failed(&id, "w1", "boom".into()).await.unwrap();
        store.pool().close().await;

        let reopened = SqliteJobStore::open(&path).await.unwrap();
        let job = reopened.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn check_constraint_rejects_unknown_state() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let now = ts(Utc::now());
        let result = sqlx::query(
            "INSERT INTO jobs (id, command, state, max_retries, created_at, updated_at, run_at) \
             VALUES ('x', 'true', 'running', 3, ?1, ?1, ?1)",
        )
        .bind(&now)
        .execute(store.pool())
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn lost_race_surfaces_as_invalid_transition() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let id = store.enqueue(NewJob::new("true")).await.unwrap();
        store.claim("w1", Duration::from_secs(30)).await.unwrap().unwrap();

        let mut job = store.fetch(&id).await.unwrap().unwrap();
        let expected = Expected::of(&job);

        // another worker took the job over between load and write-back
        sqlx::query("UPDATE jobs SET lease_owner = 'w2' WHERE id = ?1")
            .bind(id.as_str())
            .execute(store.pool())
            .await
            .unwrap();

        job.complete("w1", String::new(), Utc::now()).unwrap();
        let err = store
            .compare_and_swap(&job, &expected, "mark_completed")
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::InvalidTransition(_)));
        assert_eq!(store.get_state(&id).await.unwrap(), JobState::Processing);
    }

    #[test]
    fn timestamps_are_fixed_width() {
        let a = ts(DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z").unwrap().with_timezone(&Utc));
        let b = ts(DateTime::parse_from_rfc3339("2024-01-02T03:04:05.120Z").unwrap().with_timezone(&Utc));
        assert_eq!(a, "2024-01-02T03:04:05.000Z");
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_ts("t", &b).unwrap().timestamp_subsec_millis(), 120);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32,
            ..ProptestConfig::default()
        })]

        #[test]
        fn random_histories_keep_single_holder(
            max_retries in 0u32..4,
            ops in proptest::collection::vec(conformance::op_strategy(), 1..40),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let store = SqliteJobStore::in_memory().await.unwrap();
                conformance::random_operations_keep_single_holder(&store, max_retries, &ops).await;
            });
        }
    }
}
