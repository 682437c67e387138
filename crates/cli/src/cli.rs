//! CLI definitions for queuectl.

use std::num::NonZeroUsize;
use std::path::PathBuf;

use clap::{ArgGroup, Parser, Subcommand};

use queuectl_core::JobState;

/// queuectl CLI.
#[derive(Debug, Parser)]
#[command(name = "queuectl")]
#[command(about = "Durable shell-command job queue with retries and a dead-letter queue")]
#[command(version)]
pub(crate) struct Cli {
    /// SQLite database file
    #[arg(long, env = "QUEUECTL_DB", default_value = "queuectl.db", global = true)]
    pub db: PathBuf,

    /// Queue configuration file (created with defaults if missing)
    #[arg(long, env = "QUEUECTL_CONFIG", default_value = "config.json", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Commands {
    /// Add a job, e.g. '{"command":"echo hi","max_retries":2}'
    Enqueue {
        /// Job as JSON: command, optional id, optional max_retries
        job: String,
    },

    /// Run workers until interrupted (Ctrl-C)
    Worker {
        /// Number of concurrent workers (at least 1)
        #[arg(long, default_value_t = NonZeroUsize::MIN)]
        count: NonZeroUsize,

        /// Idle poll interval in milliseconds
        #[arg(long, default_value_t = 1000)]
        poll_ms: u64,

        /// Claim lease in seconds; renewed while a command runs
        #[arg(long, default_value_t = 30)]
        lease_secs: u64,

        /// Kill commands running longer than this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Job counts by state
    Status,

    /// List jobs, optionally filtered by state
    List {
        /// pending, processing, completed, failed or dead
        #[arg(long)]
        state: Option<JobState>,
    },

    /// Inspect or replay the dead-letter queue
    #[command(group(ArgGroup::new("dlq_action").required(true).args(["list", "retry"])))]
    Dlq {
        /// List dead jobs
        #[arg(long)]
        list: bool,

        /// Move a dead job back to pending with a fresh retry budget
        #[arg(long, value_name = "JOB_ID")]
        retry: Option<String>,
    },

    /// Show or change queue configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
pub(crate) enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Set maxRetries or backoffBase
    Set { key: String, value: String },
}
