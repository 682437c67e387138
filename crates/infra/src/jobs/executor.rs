//! Shell command execution with merged output capture.

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

/// Runs a command line to completion.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// `Ok(output)` iff the command exited with status 0.
    async fn run(&self, command: &str) -> Result<String, ExecutionFailure>;
}

/// Why a command did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Non-zero exit status.
    Exit(i32),
    /// Terminated by a signal (unix).
    Signal(i32),
    /// The shell could not be spawned or waited on.
    Launch(String),
    /// Killed after exceeding the configured timeout.
    TimedOut(Duration),
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Exit(code) => write!(f, "exited with status {code}"),
            FailureKind::Signal(signal) => write!(f, "killed by signal {signal}"),
            FailureKind::Launch(reason) => write!(f, "failed to launch: {reason}"),
            FailureKind::TimedOut(limit) => write!(f, "timed out after {limit:?}"),
        }
    }
}

/// Failed execution: the reason plus whatever output was captured.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("command {kind}")]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    pub output: String,
}

impl ExecutionFailure {
    pub fn new(kind: FailureKind, output: impl Into<String>) -> Self {
        Self {
            kind,
            output: output.into(),
        }
    }

    /// Text recorded as the job's `last_error`.
    pub fn describe(&self) -> String {
        let output = self.output.trim_end();
        if output.is_empty() {
            format!("command {}", self.kind)
        } else {
            format!("command {}: {}", self.kind, output)
        }
    }
}

/// Executes commands through the platform shell (`sh -c`, `cmd /C` on Windows).
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    timeout: Option<Duration>,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill commands that run longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn shell(command: &str) -> Command {
        let mut cmd = if cfg!(windows) {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // own process group, so a kill reaches everything the shell started
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

/// SIGKILLs the command's process group when dropped while armed.
///
/// `kill_on_drop` only reaches the shell itself; this also takes down its
/// children (`(sleep 5; echo x) & wait`). Disarmed once the shell exits on
/// its own.
#[cfg(unix)]
struct GroupKill(Option<nix::unistd::Pid>);

#[cfg(unix)]
impl GroupKill {
    fn arm(pid: Option<u32>) -> Self {
        Self(
            pid.and_then(|pid| i32::try_from(pid).ok())
                .map(nix::unistd::Pid::from_raw),
        )
    }

    fn disarm(mut self) {
        self.0 = None;
    }
}

#[cfg(unix)]
impl Drop for GroupKill {
    fn drop(&mut self) {
        use nix::sys::signal::{Signal, killpg};

        if let Some(pgid) = self.0.take() {
            if let Err(err) = killpg(pgid, Signal::SIGKILL) {
                if err != nix::errno::Errno::ESRCH {
                    debug!(pgid = pgid.as_raw(), error = %err, "failed to kill process group");
                }
            }
        }
    }
}

#[cfg(not(unix))]
struct GroupKill;

#[cfg(not(unix))]
impl GroupKill {
    fn arm(_pid: Option<u32>) -> Self {
        GroupKill
    }

    fn disarm(self) {}
}

/// Forward chunks from `reader` until EOF or a read error.
fn pipe<R>(mut reader: R, tx: mpsc::UnboundedSender<BytesMut>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            match reader.read_buf(&mut buf).await {
                Ok(n) if n > 0 => {
                    if tx.send(buf.split()).is_err() {
                        break;
                    }
                }
                _ => break,
            }
        }
    });
}

fn classify(status: ExitStatus) -> Option<FailureKind> {
    if status.success() {
        return None;
    }
    if let Some(code) = status.code() {
        return Some(FailureKind::Exit(code));
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(FailureKind::Signal(signal));
        }
    }
    Some(FailureKind::Launch(format!("unrecognized exit status {status}")))
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn run(&self, command: &str) -> Result<String, ExecutionFailure> {
        let mut child = Self::shell(command)
            .spawn()
            .map_err(|e| ExecutionFailure::new(FailureKind::Launch(e.to_string()), ""))?;
        let group = GroupKill::arm(child.id());

        // stdout and stderr share one channel so chunks interleave in arrival order
        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            pipe(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pipe(stderr, tx.clone());
        }
        drop(tx);

        let mut merged = BytesMut::new();
        let finished = {
            let collect = async {
                while let Some(chunk) = rx.recv().await {
                    merged.extend_from_slice(&chunk);
                }
            };
            let wait = async { tokio::join!(child.wait(), collect).0 };
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| limit),
                None => Ok(wait.await),
            }
        };

        let status = match finished {
            Ok(status) => {
                group.disarm();
                status
            }
            Err(limit) => {
                debug!(command, ?limit, "command timed out");
                drop(group);
                if let Err(err) = child.kill().await {
                    debug!(command, error = %err, "failed to reap timed-out command");
                }
                // keep what the command printed before it was killed
                while let Ok(chunk) = rx.try_recv() {
                    merged.extend_from_slice(&chunk);
                }
                let output = String::from_utf8_lossy(&merged).into_owned();
                return Err(ExecutionFailure::new(FailureKind::TimedOut(limit), output));
            }
        };

        let output = String::from_utf8_lossy(&merged).into_owned();
        let status =
            status.map_err(|e| ExecutionFailure::new(FailureKind::Launch(e.to_string()), output.clone()))?;

        match classify(status) {
            None => Ok(output),
            Some(kind) => Err(ExecutionFailure::new(kind, output)),
        }
    }
}
