//! Durable shell-command job queue with retry, backoff, and dead-letter handling.
//!
//! ## Design
//!
//! - Jobs are claimed atomically with a time-bounded lease
//! - Failed jobs are requeued after an exponential backoff delay
//! - Jobs that exhaust their retry budget land in the dead-letter queue (`dead`)
//! - A reaper recovers jobs orphaned by crashed workers or lost timers
//!
//! ## Components
//!
//! - `JobStore`: persistence contract (`InMemoryJobStore`, `SqliteJobStore`)
//! - `CommandExecutor`: runs a command line (`ShellExecutor`)
//! - `WorkerLoop`: claim, execute, record, schedule retries
//! - `Supervisor`: runs N workers plus the reaper and shuts them down

pub mod executor;
pub mod sqlite;
pub mod store;
pub mod supervisor;
pub mod worker;

#[cfg(test)]
pub(crate) mod conformance;

pub use executor::{CommandExecutor, ExecutionFailure, FailureKind, ShellExecutor};
pub use sqlite::SqliteJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use supervisor::{ReapReport, Supervisor, SupervisorConfig, SupervisorHandle, reap_once};
pub use worker::{Tick, WorkerConfig, WorkerLoop, WorkerStats};
