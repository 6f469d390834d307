// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Algorithm processes and the driver speaking to them.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use beat_protocol::{AlgorithmCommand, Frame};
use serde_json::{Map, Value};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ExecutionError, Failure, HandlerLink};
use crate::dock::drain;
use crate::stats::{CpuStatistics, MemoryStatistics};

/// Grace period for a reply that was sent right before the process exited.
const LATE_REPLY_GRACE: Duration = Duration::from_millis(500);

/// How long a finished algorithm gets to exit on its own.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Which algorithm of the block a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmRole {
    /// The block's algorithm
    Main,
    /// The loop algorithm
    Loop,
}

/// Everything an algorithm process needs to start.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Which algorithm
    pub role: AlgorithmRole,
    /// Where the message handler listens, `tcp://ip:port`
    pub handler_address: String,
    /// Exported configuration (`configuration.json` and `prefix/`)
    pub configuration_dir: PathBuf,
    /// Data cache
    pub cache: PathBuf,
}

/// Output collected from a finished algorithm process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessLogs {
    /// Separate streams
    Split {
        /// Standard output
        stdout: String,
        /// Standard error
        stderr: String,
    },
    /// Interleaved streams (container logs)
    Merged(String),
}

impl Default for ProcessLogs {
    fn default() -> Self {
        Self::Merged(String::new())
    }
}

/// What is left of an algorithm process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Output
    pub logs: ProcessLogs,
    /// CPU usage, when the launcher measures it
    pub cpu: Option<CpuStatistics>,
    /// Memory usage, when the launcher measures it
    pub memory: Option<MemoryStatistics>,
}

/// A running algorithm process.
#[async_trait]
pub trait AlgorithmProcess: Send {
    /// Wait for the process to exit and return its exit code.
    ///
    /// Must be cancel safe and keep returning the code once exited.
    async fn wait(&mut self) -> Option<i32>;

    /// Kill the process.
    async fn kill(&mut self);

    /// Reap the process and collect its output.
    async fn finish(self: Box<Self>) -> ProcessOutput;
}

/// Starts algorithm processes.
#[async_trait]
pub trait AlgorithmLauncher: Send + Sync {
    /// Start the process described by `request`; it connects to the handler.
    async fn launch(
        &self,
        request: &LaunchRequest,
    ) -> Result<Box<dyn AlgorithmProcess>, ExecutionError>;
}

/// Launches the algorithm entry points as local processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    execute_program: String,
    loop_execute_program: String,
    debug: bool,
}

impl ProcessLauncher {
    /// Launcher running `execute_program` for main algorithms and
    /// `loop_execute_program` for loop algorithms.
    pub fn new(execute_program: impl Into<String>, loop_execute_program: impl Into<String>) -> Self {
        Self {
            execute_program: execute_program.into(),
            loop_execute_program: loop_execute_program.into(),
            debug: tracing::enabled!(tracing::Level::DEBUG),
        }
    }

    /// Arguments common to every entry point.
    pub fn arguments(request: &LaunchRequest, cache: &str, configuration_dir: &str, debug: bool) -> Vec<String> {
        let mut args = Vec::with_capacity(4);
        if debug {
            args.push("--debug".to_string());
        }
        args.push(format!("--cache={cache}"));
        args.push(request.handler_address.clone());
        args.push(configuration_dir.to_string());
        args
    }
}

#[async_trait]
impl AlgorithmLauncher for ProcessLauncher {
    async fn launch(
        &self,
        request: &LaunchRequest,
    ) -> Result<Box<dyn AlgorithmProcess>, ExecutionError> {
        let program = match request.role {
            AlgorithmRole::Main => &self.execute_program,
            AlgorithmRole::Loop => &self.loop_execute_program,
        };
        let args = Self::arguments(
            request,
            &request.cache.to_string_lossy(),
            &request.configuration_dir.to_string_lossy(),
            self.debug,
        );
        debug!(program = %program, args = ?args, role = ?request.role, "Launching algorithm process");

        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionError::Launch(format!("`{program}': {e}")))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        Ok(Box::new(LocalProcess {
            child,
            stdout,
            stderr,
            exit: None,
        }))
    }
}

struct LocalProcess {
    child: Child,
    stdout: JoinHandle<String>,
    stderr: JoinHandle<String>,
    exit: Option<Option<i32>>,
}

#[async_trait]
impl AlgorithmProcess for LocalProcess {
    async fn wait(&mut self) -> Option<i32> {
        if let Some(code) = self.exit {
            return code;
        }
        let code = match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(error = %e, "Failed to wait for the algorithm process");
                None
            }
        };
        self.exit = Some(code);
        code
    }

    async fn kill(&mut self) {
        if self.exit.is_none()
            && let Err(e) = self.child.start_kill()
        {
            debug!(error = %e, "Failed to kill the algorithm process");
        }
    }

    async fn finish(mut self: Box<Self>) -> ProcessOutput {
        if self.exit.is_none()
            && tokio::time::timeout(EXIT_GRACE, self.wait()).await.is_err()
        {
            warn!("Algorithm process did not exit, killing it");
            self.kill().await;
            self.wait().await;
        }
        ProcessOutput {
            logs: ProcessLogs::Split {
                stdout: self.stdout.await.unwrap_or_default(),
                stderr: self.stderr.await.unwrap_or_default(),
            },
            cpu: None,
            memory: None,
        }
    }
}

/// Drives one algorithm through setup, prepare and process.
pub(crate) struct AlgorithmDriver<'a> {
    link: HandlerLink,
    process: &'a mut dyn AlgorithmProcess,
}

impl<'a> AlgorithmDriver<'a> {
    pub(crate) fn new(link: HandlerLink, process: &'a mut dyn AlgorithmProcess) -> Self {
        Self { link, process }
    }

    /// Send a control request and wait for its reply, unless the process
    /// exits or `timeout` elapses first.
    async fn request(
        &mut self,
        frame: Frame,
        timeout: Option<Duration>,
    ) -> Result<Frame, ExecutionError> {
        let link = self.link.clone();
        let reply = link.request(frame);
        tokio::pin!(reply);

        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let outcome = tokio::select! {
            biased;

            result = &mut reply => result,

            code = self.process.wait() => {
                // A reply may still be in flight.
                match tokio::time::timeout(LATE_REPLY_GRACE, &mut reply).await {
                    Ok(result) => result,
                    Err(_) => Err(ExecutionError::ProcessExited(code)),
                }
            }

            _ = &mut deadline => {
                Err(ExecutionError::Timeout(timeout.unwrap_or_default()))
            }
        };

        let frame = outcome.map_err(|e| match e {
            ExecutionError::Protocol(_) | ExecutionError::HandlerClosed => {
                ExecutionError::ProcessExited(None)
            }
            other => other,
        })?;

        match frame.command().map(AlgorithmCommand::try_from) {
            Some(Ok(AlgorithmCommand::Ack)) => Ok(frame),
            Some(Ok(AlgorithmCommand::Error)) => Err(ExecutionError::Algorithm(Failure::parse(
                frame.part(1).map(|p| &p[..]).unwrap_or_default(),
            ))),
            _ => Err(ExecutionError::Algorithm(Failure::system(
                "ProtocolError",
                "unexpected reply from algorithm",
            ))),
        }
    }

    /// `stp <parameters>`
    pub(crate) async fn setup(&mut self, parameters: &Map<String, Value>) -> Result<(), ExecutionError> {
        let frame = Frame::command_only(AlgorithmCommand::Setup.as_bytes())
            .with_part(Value::Object(parameters.clone()).to_string());
        self.request(frame, None).await.map(drop)
    }

    /// `pre`
    pub(crate) async fn prepare(&mut self) -> Result<(), ExecutionError> {
        self.request(Frame::command_only(AlgorithmCommand::Prepare.as_bytes()), None)
            .await
            .map(drop)
    }

    /// `prc`, bounded by `timeout`.
    pub(crate) async fn process(&mut self, timeout: Option<Duration>) -> Result<(), ExecutionError> {
        self.request(Frame::command_only(AlgorithmCommand::Process.as_bytes()), timeout)
            .await
            .map(drop)
    }

    /// `don`, telling the algorithm to exit.
    pub(crate) async fn done(&mut self) -> Result<(), ExecutionError> {
        self.request(
            Frame::command_only(AlgorithmCommand::Done.as_bytes()),
            Some(EXIT_GRACE),
        )
        .await
        .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> LaunchRequest {
        LaunchRequest {
            role: AlgorithmRole::Main,
            handler_address: "tcp://127.0.0.1:4000".to_string(),
            configuration_dir: PathBuf::from("/tmp/cfg"),
            cache: PathBuf::from("/cache"),
        }
    }

    #[test]
    fn test_arguments() {
        assert_eq!(
            ProcessLauncher::arguments(&request(), "/cache", "/tmp/cfg", false),
            vec!["--cache=/cache", "tcp://127.0.0.1:4000", "/tmp/cfg"]
        );
        assert_eq!(
            ProcessLauncher::arguments(&request(), "/beat/cache", "/beat/prefix", true)[0],
            "--debug"
        );
    }

    #[tokio::test]
    async fn test_launch_collects_output() {
        let launcher = ProcessLauncher::new("echo", "echo");
        let mut process = launcher.launch(&request()).await.unwrap();
        assert_eq!(process.wait().await, Some(0));
        assert_eq!(process.wait().await, Some(0));

        let output = process.finish().await;
        match output.logs {
            ProcessLogs::Split { stdout, .. } => assert!(stdout.contains("tcp://127.0.0.1:4000")),
            other => panic!("unexpected logs {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_launch_missing_program() {
        let launcher = ProcessLauncher::new("/nonexistent/execute", "/nonexistent/loop");
        let err = launcher.launch(&request()).await.err().unwrap();
        assert!(matches!(err, ExecutionError::Launch(_)));
    }
}
