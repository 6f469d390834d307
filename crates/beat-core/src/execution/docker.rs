// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution inside containers.
//!
//! The algorithm processes run in containers of the block's environment and
//! connect back to handlers listening on every host interface. The exported
//! configuration is mounted at `/beat/prefix`, the data cache at
//! `/beat/cache`.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::algorithm::{
    AlgorithmLauncher, AlgorithmProcess, AlgorithmRole, LaunchRequest, ProcessLauncher,
    ProcessLogs, ProcessOutput,
};
use super::engine::{self, EngineOptions};
use super::{ExecutionContext, ExecutionError, ExecutionResult, Executor, ResourceLimits};
use crate::config::Config;
use crate::dock::{Container, Host};
use crate::stats::{CpuStatistics, MemoryStatistics, ResourceStatistics};

/// Mount point of the exported configuration.
pub const CONFIGURATION_MOUNT: &str = "/beat/prefix";

/// Mount point of the data cache.
pub const CACHE_MOUNT: &str = "/beat/cache";

/// Mount root of raw database folders.
pub const DATABASES_MOUNT: &str = "/databases";

const DEFAULT_NETWORK: &str = "bridge";

/// How often a running container is sampled for statistics.
const SAMPLING_INTERVAL: Duration = Duration::from_secs(1);

/// How long a finished container gets to exit on its own.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Runs the algorithms of a block in containers of a docker host.
#[derive(Debug, Clone)]
pub struct DockerExecutor {
    host: Arc<Host>,
    execute_program: String,
    loop_execute_program: String,
}

impl DockerExecutor {
    /// Executor on `host`, starting the configured entry points.
    pub fn new(host: Arc<Host>, config: &Config) -> Self {
        Self {
            host,
            execute_program: config.execute_program.clone(),
            loop_execute_program: config.loop_execute_program.clone(),
        }
    }

    fn image(&self, key: &str) -> Result<String, ExecutionError> {
        self.host
            .env2docker(key)
            .map(str::to_string)
            .ok_or_else(|| ExecutionError::EnvironmentNotFound {
                key: key.to_string(),
                available: self.host.processing_environments().keys().cloned().collect(),
            })
    }
}

struct ContainerLauncher {
    host: Arc<Host>,
    main_image: String,
    loop_image: Option<String>,
    execute_program: String,
    loop_execute_program: String,
    uid: u32,
    network: String,
    cache_source: String,
    raw_data: Vec<(String, String)>,
    limits: ResourceLimits,
}

#[async_trait]
impl AlgorithmLauncher for ContainerLauncher {
    async fn launch(
        &self,
        request: &LaunchRequest,
    ) -> Result<Box<dyn AlgorithmProcess>, ExecutionError> {
        let (image, program) = match request.role {
            AlgorithmRole::Main => (&self.main_image, &self.execute_program),
            AlgorithmRole::Loop => (
                self.loop_image.as_ref().unwrap_or(&self.main_image),
                &self.loop_execute_program,
            ),
        };

        let mut command = vec![program.clone()];
        command.extend(ProcessLauncher::arguments(
            request,
            CACHE_MOUNT,
            CONFIGURATION_MOUNT,
            tracing::enabled!(tracing::Level::DEBUG),
        ));

        let role = match request.role {
            AlgorithmRole::Main => "main",
            AlgorithmRole::Loop => "loop",
        };
        let mut container = self.host.create_container(image, command);
        container.set_name(format!("beat-{role}-{}", uuid::Uuid::new_v4().simple()));
        container.network_name = Some(self.network.clone());
        container.uid = Some(self.uid);
        container.add_volume(
            request.configuration_dir.to_string_lossy(),
            CONFIGURATION_MOUNT,
            true,
        );
        container.add_volume(self.cache_source.clone(), CACHE_MOUNT, true);
        for (source, target) in &self.raw_data {
            container.add_volume(source.clone(), target.clone(), true);
        }

        self.host
            .start(
                &mut container,
                self.limits.max_memory_mb,
                self.limits.max_cpu_percent,
            )
            .await?;
        info!(
            container_id = ?container.id,
            image = %image,
            role = ?request.role,
            "Algorithm container started"
        );

        Ok(Box::new(ContainerProcess {
            host: self.host.clone(),
            container,
            exit: None,
            cpu: CpuStatistics::default(),
            memory: MemoryStatistics::default(),
        }))
    }
}

struct ContainerProcess {
    host: Arc<Host>,
    container: Container,
    exit: Option<Option<i32>>,
    cpu: CpuStatistics,
    memory: MemoryStatistics,
}

impl ContainerProcess {
    async fn sample(&mut self) {
        let statistics = self.host.statistics(&self.container).await;
        self.cpu += statistics.cpu;
        self.memory += statistics.memory;
    }
}

#[async_trait]
impl AlgorithmProcess for ContainerProcess {
    async fn wait(&mut self) -> Option<i32> {
        if let Some(code) = self.exit {
            return code;
        }
        loop {
            if let Some(code) = self.host.wait(&self.container, Some(SAMPLING_INTERVAL)).await {
                self.exit = Some(Some(code));
                return Some(code);
            }
            match self.host.status(&self.container).await.as_deref() {
                Some("running" | "created" | "restarting") => self.sample().await,
                status => {
                    warn!(container_id = ?self.container.id, status = ?status, "Cannot wait for container");
                    self.exit = Some(None);
                    return None;
                }
            }
        }
    }

    async fn kill(&mut self) {
        if self.exit.is_some() {
            return;
        }
        if let Err(e) = self.host.kill(&self.container).await {
            warn!(container_id = ?self.container.id, error = %e, "Failed to kill container");
        }
    }

    async fn finish(mut self: Box<Self>) -> ProcessOutput {
        if self.exit.is_none()
            && tokio::time::timeout(EXIT_GRACE, self.wait()).await.is_err()
        {
            self.kill().await;
            self.wait().await;
        }

        let logs = self.host.logs(&self.container).await;
        debug!(container_id = ?self.container.id, logs = %logs, "Container logs");
        if let Err(e) = self.host.rm(&mut self.container).await {
            warn!(error = %e, "Failed to remove container");
        }

        ProcessOutput {
            logs: ProcessLogs::Merged(logs),
            cpu: Some(self.cpu.clone()),
            memory: Some(self.memory.clone()),
        }
    }
}

fn current_uid() -> u32 {
    nix::unistd::geteuid().as_raw()
}

#[async_trait]
impl Executor for DockerExecutor {
    async fn process(
        &self,
        context: &mut ExecutionContext,
        limits: &ResourceLimits,
    ) -> Result<ExecutionResult, ExecutionError> {
        if !context.valid() {
            return Err(ExecutionError::InvalidBlock(context.errors.clone()));
        }
        let Some(block) = context.block() else {
            return Err(ExecutionError::InvalidBlock(context.errors.clone()));
        };

        let key = block
            .environment
            .as_ref()
            .map(|env| env.key())
            .unwrap_or_default();
        let main_image = self.image(&key)?;
        let loop_image = match block.loop_block.as_ref().and_then(|l| l.environment.as_ref()) {
            Some(env) => Some(self.image(&env.key())?),
            None => None,
        };

        let raw_data = context
            .databases()
            .values()
            .filter(|db| db.direct_rawdata_access)
            .filter_map(|db| {
                let root = db.root_folder.as_ref()?;
                Some((
                    root.to_string_lossy().into_owned(),
                    format!("{DATABASES_MOUNT}/{}", db.name),
                ))
            })
            .collect();

        let launcher = ContainerLauncher {
            host: self.host.clone(),
            main_image,
            loop_image,
            execute_program: self.execute_program.clone(),
            loop_execute_program: self.loop_execute_program.clone(),
            uid: block.datasets_uid.unwrap_or_else(current_uid),
            network: block
                .network_name
                .clone()
                .unwrap_or_else(|| DEFAULT_NETWORK.to_string()),
            cache_source: block
                .cache_mount_point
                .clone()
                .unwrap_or_else(|| context.cache().to_string_lossy().into_owned()),
            raw_data,
            limits: *limits,
        };

        let advertised_ip = self.host.ip().parse().unwrap_or_else(|e| {
            warn!(error = %e, "Invalid host address, using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        });
        let options = EngineOptions {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertised_ip,
            port_range: block.port_range(),
            timeout: limits.timeout(),
            configuration_mount: Some(PathBuf::from(CONFIGURATION_MOUNT)),
        };

        let outcome = engine::run(context, &launcher, &options).await?;

        let mut statistics = ResourceStatistics {
            data: outcome.data,
            ..ResourceStatistics::default()
        };
        let mut logs = String::new();
        for output in outcome.looped.into_iter().chain(outcome.main) {
            statistics.cpu += output.cpu.unwrap_or_default();
            statistics.memory += output.memory.unwrap_or_default();
            match output.logs {
                ProcessLogs::Merged(text) => logs.push_str(&text),
                ProcessLogs::Split { stdout, stderr } => {
                    logs.push_str(&stdout);
                    logs.push_str(&stderr);
                }
            }
        }

        let (stdout, stderr) = if outcome.status == 0 {
            (logs, String::new())
        } else {
            (String::new(), logs)
        };

        info!(
            status = outcome.status,
            timed_out = outcome.timed_out,
            environment = %key,
            "Container execution finished"
        );
        Ok(ExecutionResult {
            status: outcome.status,
            statistics,
            stderr,
            stdout,
            system_error: outcome.system_error,
            user_error: outcome.user_error,
            timed_out: outcome.timed_out,
        })
    }
}
