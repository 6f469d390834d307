// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shell-out abstraction for the container runtime CLI.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long the pipes of a killed command may stay open.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit status; `None` when the command was killed (timeout or signal)
    pub status: Option<i32>,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl ExecOutput {
    /// Successful output.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output.
    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs CLI commands.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `program args...`, capturing its output.
    ///
    /// With a timeout, the command is polled every 100ms and killed once the
    /// timeout elapses; the result then has no status.
    async fn exec(
        &self,
        program: &str,
        args: &[String],
        timeout: Option<Duration>,
    ) -> std::io::Result<ExecOutput>;
}

/// Executor spawning real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExecutor;

/// Read a child pipe to the end on its own task.
pub(crate) fn drain<R>(pipe: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            if let Err(e) = pipe.read_to_end(&mut buf).await {
                debug!(error = %e, "Cannot read the command output");
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Output collected by `pipe`, giving up after [`DRAIN_GRACE`].
///
/// Processes that inherited the pipe can keep it open after the command was
/// killed.
async fn drained(mut pipe: JoinHandle<String>, killed: bool) -> String {
    if !killed {
        return pipe.await.unwrap_or_default();
    }
    match tokio::time::timeout(DRAIN_GRACE, &mut pipe).await {
        Ok(output) => output.unwrap_or_default(),
        Err(_) => {
            debug!("Pipe still open after kill, dropping its output");
            pipe.abort();
            String::new()
        }
    }
}

/// SIGKILL the process group led by `pid`.
fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = nix::sys::signal::killpg(
        nix::unistd::Pid::from_raw(pid),
        nix::sys::signal::Signal::SIGKILL,
    ) {
        debug!(pid, error = %e, "Failed to kill process group");
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn exec(
        &self,
        program: &str,
        args: &[String],
        timeout: Option<Duration>,
    ) -> std::io::Result<ExecOutput> {
        debug!(program = %program, args = ?args, "Executing");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0)
            .spawn()?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let mut killed = false;
        let status = match timeout {
            None => child.wait().await?.code(),
            Some(limit) => {
                let poll_interval = Duration::from_millis(100);
                let start = Instant::now();
                loop {
                    if let Some(status) = child.try_wait()? {
                        break status.code();
                    }
                    if start.elapsed() >= limit {
                        warn!(program = %program, timeout_ms = limit.as_millis() as u64, "Command timed out, killing it");
                        kill_group(child.id());
                        child.start_kill()?;
                        if let Err(e) = child.wait().await {
                            debug!(program = %program, error = %e, "Failed to reap killed command");
                        }
                        killed = true;
                        break None;
                    }
                    tokio::time::sleep(poll_interval).await;
                }
            }
        };

        Ok(ExecOutput {
            status,
            stdout: drained(stdout, killed).await,
            stderr: drained(stderr, killed).await,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_exec_captures_output() {
        let output = ProcessExecutor
            .exec("sh", &args(&["-c", "echo out; echo err >&2; exit 3"]), None)
            .await
            .unwrap();
        assert_eq!(output.status, Some(3));
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_exec_timeout_kills() {
        let start = Instant::now();
        let output = ProcessExecutor
            .exec(
                "sh",
                &args(&["-c", "sleep 30"]),
                Some(Duration::from_millis(300)),
            )
            .await
            .unwrap();
        assert_eq!(output.status, None);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_exec_timeout_kills_background_children() {
        let start = Instant::now();
        let output = ProcessExecutor
            .exec(
                "sh",
                &args(&["-c", "sleep 30 & sleep 30 & wait"]),
                Some(Duration::from_millis(300)),
            )
            .await
            .unwrap();
        assert_eq!(output.status, None);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_exec_missing_program() {
        let result = ProcessExecutor
            .exec("/nonexistent/beat-docker", &[], None)
            .await;
        assert!(result.is_err());
    }
}
