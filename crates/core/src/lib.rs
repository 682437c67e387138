//! `queuectl-core`: job lifecycle building blocks.
//!
//! This crate contains the **pure** parts of the queue (no I/O): the job
//! record and its state machine, the backoff curve and the validated queue
//! configuration. Storage, process execution and workers live in
//! `queuectl-infra`.

pub mod backoff;
pub mod config;
pub mod error;
pub mod job;

pub use backoff::{BackoffPolicy, delay_ms};
pub use config::{ConfigError, QueueConfig};
pub use error::{DomainError, DomainResult};
pub use job::{DEFAULT_MAX_RETRIES, FailureDecision, FailureOutcome, Job, JobId, JobState, JobStats, NewJob};
