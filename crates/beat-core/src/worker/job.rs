// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Jobs and the processes running them.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::declaration::DeclarationCaches;
use crate::dock::{Host, HostCatalog, HostConfig, ProcessExecutor, drain};
use crate::execution::{ExecutionContext, ExecutionResult, ExecutionTarget, Executor};

/// Where the jobs of a worker run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetSpec {
    /// Local processes
    #[default]
    Local,
    /// Containers
    Container {
        /// Environments discovered by the worker
        catalog: HostCatalog,
        /// Network of the algorithm containers
        #[serde(default, skip_serializing_if = "Option::is_none")]
        network: Option<String>,
        /// Ports the handlers may use, `min:max`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port_range: Option<String>,
    },
}

/// Everything a job process needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Scheduler assigned id
    pub job_id: String,
    /// Execution block
    pub block: Value,
    /// Declaration prefix
    pub prefix: PathBuf,
    /// Data cache
    pub cache: PathBuf,
    /// Execution target
    pub target: TargetSpec,
}

/// What a job process reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    /// The block ran; its status may still be a processing failure
    Completed {
        /// Execution summary
        result: ExecutionResult,
    },
    /// The block did not validate
    ValidationFailed {
        /// Summary
        error: String,
        /// One entry per problem
        details: Vec<String>,
    },
    /// Anything else went wrong
    Crashed {
        /// Error description
        system_error: String,
    },
}

/// Run one job to completion. Never fails: every problem becomes an outcome.
pub async fn run_job(request: JobRequest, config: &Config) -> JobOutcome {
    match run_job_until(request, config, std::future::pending()).await {
        Some(outcome) => outcome,
        None => JobOutcome::Crashed {
            system_error: "job cancelled".to_string(),
        },
    }
}

/// Run one job unless `cancelled` completes first.
///
/// On cancellation the execution is dropped, which kills its local algorithm
/// processes, and the containers it started are removed. Returns `None` in
/// that case.
pub async fn run_job_until(
    request: JobRequest,
    config: &Config,
    cancelled: impl Future<Output = ()>,
) -> Option<JobOutcome> {
    let mut block = request.block;
    let target = match request.target {
        TargetSpec::Local => ExecutionTarget::Local,
        TargetSpec::Container {
            catalog,
            network,
            port_range,
        } => {
            if let Some(object) = block.as_object_mut() {
                if let Some(network) = network {
                    object
                        .entry("network_name")
                        .or_insert(Value::String(network));
                }
                if let Some(port_range) = port_range {
                    object
                        .entry("port_range")
                        .or_insert(Value::String(port_range));
                }
            }
            let host = Host::from_catalog(
                HostConfig {
                    discover: false,
                    ..HostConfig::from(config)
                },
                catalog,
                Arc::new(ProcessExecutor),
            );
            ExecutionTarget::Container(Arc::new(host))
        }
    };

    let mut caches = DeclarationCaches::new();
    let mut context = match ExecutionContext::new(
        &request.prefix,
        block,
        &request.cache,
        &mut caches,
        None,
    ) {
        Ok(context) => context,
        Err(e) => {
            return Some(JobOutcome::Crashed {
                system_error: e.to_string(),
            });
        }
    };
    if !context.valid() {
        return Some(JobOutcome::ValidationFailed {
            error: "Failed to load execution information".to_string(),
            details: context.errors.clone(),
        });
    }

    let executor: Box<dyn Executor> = target.executor(config);
    let outcome = tokio::select! {
        processed = executor.process(&mut context, &config.limits) => Some(match processed {
            Ok(result) => JobOutcome::Completed { result },
            Err(e) => JobOutcome::Crashed {
                system_error: e.to_string(),
            },
        }),
        () = cancelled => {
            warn!("Job cancelled, abandoning the execution");
            None
        }
    };
    drop(context);
    if let ExecutionTarget::Container(host) = &target {
        host.teardown().await;
    }
    outcome
}

/// A job running in its own process.
#[derive(Debug)]
pub(crate) struct JobProcess {
    id: String,
    child: Child,
    stdout: Option<JoinHandle<String>>,
}

impl JobProcess {
    /// Start `command` and feed it `request` on its standard input.
    pub(crate) fn spawn(command: &[String], request: &JobRequest) -> std::io::Result<Self> {
        let Some((program, args)) = command.split_first() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty job command",
            ));
        };
        let payload = serde_json::to_vec(request)?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let job_id = request.job_id.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(job_id = %job_id, error = %e, "Job process did not read its request");
                }
            });
        }
        let stdout = Some(drain(child.stdout.take()));
        info!(job_id = %request.job_id, pid = ?child.id(), "Job process started");

        Ok(Self {
            id: request.job_id.clone(),
            child,
            stdout,
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    /// Outcome of the job once its process exited.
    pub(crate) async fn try_outcome(&mut self) -> Option<JobOutcome> {
        let status = match self.child.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return None,
            Err(e) => {
                return Some(JobOutcome::Crashed {
                    system_error: format!("cannot wait for the job process: {e}"),
                });
            }
        };

        let output = match self.stdout.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let outcome = output
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str::<JobOutcome>(line.trim()).ok())
            .unwrap_or_else(|| JobOutcome::Crashed {
                system_error: format!("job process exited with {status} without reporting"),
            });
        Some(outcome)
    }

    /// Ask the process to stop (SIGTERM), letting it clean up.
    pub(crate) fn request_stop(&self) {
        let Some(pid) = self.child.id().and_then(|pid| i32::try_from(pid).ok()) else {
            return;
        };
        if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
            debug!(job_id = %self.id, error = %e, "SIGTERM failed");
        }
    }

    /// Wait up to `grace` for the process to exit, then SIGKILL it.
    pub(crate) async fn reap(&mut self, grace: Duration) {
        if tokio::time::timeout(grace, self.child.wait()).await.is_ok() {
            return;
        }
        warn!(job_id = %self.id, "Job process ignored SIGTERM, killing it");
        if let Err(e) = self.child.kill().await {
            debug!(job_id = %self.id, error = %e, "SIGKILL failed");
        }
    }

    /// Terminate the process: SIGTERM, then SIGKILL after `grace`.
    pub(crate) async fn terminate(&mut self, grace: Duration) {
        self.request_stop();
        self.reap(grace).await;
    }
}
