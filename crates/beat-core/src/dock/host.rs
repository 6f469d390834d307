// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker host: container lifecycle on top of the runtime CLI.

use std::collections::{BTreeMap, HashMap};
use std::net::UdpSocket;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::DockError;
use super::cgroup::CgroupReader;
use super::command::{CommandExecutor, ExecOutput, ProcessExecutor};
use super::container::Container;
use super::images::{EnvironmentInfo, ImagesCache};
use crate::config::Config;
use crate::stats::{CpuSample, CpuStatistics, MemoryStatistics, cpu_statistics};

/// CFS scheduling period used for CPU quotas, in microseconds.
const CPU_PERIOD_USEC: u64 = 100_000;

/// Environments by key (`"name (version)"`).
pub type Catalog = BTreeMap<String, EnvironmentInfo>;

/// Host settings.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Container runtime CLI
    pub program: String,
    /// File persisting the images cache
    pub images_cache: Option<PathBuf>,
    /// Raise on discovery problems instead of logging them
    pub raise_on_errors: bool,
    /// Discover environments on construction
    pub discover: bool,
    /// Address containers use to reach this host, detected when absent
    pub host_address: Option<String>,
    /// cgroup filesystem mount point
    pub cgroup_root: PathBuf,
    /// proc filesystem mount point
    pub proc_root: PathBuf,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for HostConfig {
    fn from(config: &Config) -> Self {
        Self {
            program: config.docker_program.clone(),
            images_cache: config.images_cache.clone(),
            raise_on_errors: config.docker_strict,
            discover: true,
            host_address: config.host_address.clone(),
            cgroup_root: config.cgroup_root.clone(),
            proc_root: config.proc_root.clone(),
        }
    }
}

/// Discovered environments, transferable to another process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostCatalog {
    /// Environments able to run algorithms
    pub processing_environments: Catalog,
    /// Environments able to serve databases
    pub db_environments: Catalog,
    /// Image metadata
    #[serde(default)]
    pub images_cache: ImagesCache,
}

/// CPU and memory snapshot of a container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerStatistics {
    /// CPU usage since the previous snapshot
    pub cpu: CpuStatistics,
    /// Peak memory usage
    pub memory: MemoryStatistics,
}

/// A docker host.
///
/// The host tracks every container it assigned an id to, so that
/// [`Host::teardown`] can always reclaim them.
pub struct Host {
    pub(super) config: HostConfig,
    pub(super) executor: Arc<dyn CommandExecutor>,
    pub(super) images_cache: Mutex<ImagesCache>,
    pub(super) processing_environments: Catalog,
    pub(super) db_environments: Catalog,
    containers: Mutex<Vec<String>>,
    cpu_samples: Mutex<HashMap<String, CpuSample>>,
    cgroups: CgroupReader,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("program", &self.config.program)
            .field("processing_environments", &self.processing_environments.len())
            .field("db_environments", &self.db_environments.len())
            .finish_non_exhaustive()
    }
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

impl Host {
    /// Connect to the host through the runtime CLI.
    pub async fn new(config: HostConfig) -> Result<Self, DockError> {
        Self::with_executor(config, Arc::new(ProcessExecutor)).await
    }

    /// Host driven through a custom executor.
    ///
    /// Loads the images cache file, discovers environments when configured to
    /// and persists the cache again.
    pub async fn with_executor(
        config: HostConfig,
        executor: Arc<dyn CommandExecutor>,
    ) -> Result<Self, DockError> {
        let images_cache = config
            .images_cache
            .as_deref()
            .map(ImagesCache::load)
            .unwrap_or_default();
        let mut host = Self::from_catalog(
            config,
            HostCatalog {
                images_cache,
                ..HostCatalog::default()
            },
            executor,
        );

        if host.config.discover {
            host.discover_environments().await?;
        }
        host.persist_images_cache();
        Ok(host)
    }

    /// Host reusing an already discovered catalog.
    pub fn from_catalog(
        config: HostConfig,
        catalog: HostCatalog,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        let cgroups = CgroupReader::new(&config.cgroup_root, &config.proc_root);
        Self {
            config,
            executor,
            images_cache: Mutex::new(catalog.images_cache),
            processing_environments: catalog.processing_environments,
            db_environments: catalog.db_environments,
            containers: Mutex::new(Vec::new()),
            cpu_samples: Mutex::new(HashMap::new()),
            cgroups,
        }
    }

    /// Snapshot of the discovered environments.
    pub fn catalog(&self) -> HostCatalog {
        HostCatalog {
            processing_environments: self.processing_environments.clone(),
            db_environments: self.db_environments.clone(),
            images_cache: self.images_cache.lock().clone(),
        }
    }

    /// Environments able to run algorithms.
    pub fn processing_environments(&self) -> &Catalog {
        &self.processing_environments
    }

    /// Environments able to serve databases.
    pub fn db_environments(&self) -> &Catalog {
        &self.db_environments
    }

    /// Host settings.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Whether `key` names a known environment.
    pub fn contains(&self, key: &str) -> bool {
        self.processing_environments.contains_key(key) || self.db_environments.contains_key(key)
    }

    /// Image of a processing environment.
    pub fn env2docker(&self, key: &str) -> Option<&str> {
        self.processing_environments
            .get(key)
            .map(|info| info.image.as_str())
    }

    /// Image of the first database environment serving every database in `names`.
    pub fn db2docker(&self, names: &[&str]) -> Option<&str> {
        self.db_environments
            .values()
            .find(|info| {
                let databases = info.databases.as_deref().unwrap_or_default();
                names.iter().all(|name| databases.iter().any(|d| d == name))
            })
            .map(|info| info.image.as_str())
    }

    /// Image of a database environment.
    pub fn dbenv2docker(&self, key: &str) -> Option<&str> {
        self.db_environments.get(key).map(|info| info.image.as_str())
    }

    /// Complete key of the environment called `name`, processing environments first.
    pub fn full_environment_name(&self, name: &str) -> Option<String> {
        let prefix = format!("{name} (");
        self.processing_environments
            .keys()
            .chain(self.db_environments.keys())
            .find(|key| key.starts_with(&prefix))
            .cloned()
    }

    /// Address containers use to reach this host.
    ///
    /// Uses the configured address, else the address of the outbound
    /// interface (connecting a UDP socket sends no packet).
    pub fn ip(&self) -> String {
        if let Some(address) = &self.config.host_address {
            return address.clone();
        }
        UdpSocket::bind("0.0.0.0:0")
            .and_then(|socket| {
                socket.connect("8.8.8.8:1")?;
                socket.local_addr()
            })
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|e| {
                warn!(error = %e, "Could not detect the host address, using loopback");
                "127.0.0.1".to_string()
            })
    }

    pub(super) async fn exec(
        &self,
        args: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, DockError> {
        match self.executor.exec(&self.config.program, &args, timeout).await {
            Ok(output) => Ok(output),
            Err(source) if self.config.raise_on_errors => Err(DockError::Spawn {
                program: self.config.program.clone(),
                source,
            }),
            Err(e) => {
                error!(program = %self.config.program, error = %e, "Failed to run the container runtime");
                Ok(ExecOutput::failed(-1, e.to_string()))
            }
        }
    }

    /// Unstarted container for an environment key or an image reference.
    pub fn create_container(&self, image: &str, command: Vec<String>) -> Container {
        let image = self.env2docker(image).unwrap_or(image);
        let mut container = Container::new(image, command);
        if let Some(info) = self.images_cache.lock().get(image) {
            for (path, size) in &info.custom_tmpfs {
                container.add_tmpfs(path.clone(), size.clone());
            }
        }
        container
    }

    fn run_arguments(
        &self,
        container: &Container,
        virtual_memory_mb: u64,
        max_cpu_percent: u32,
    ) -> Vec<String> {
        let mut cmd = args(&["run", "--tty", "--interactive", "--detach", "--read-only"]);
        cmd.extend(container.option_args());

        let wants_gpu = self
            .images_cache
            .lock()
            .get(&container.image)
            .is_some_and(|info| info.has_capability("gpu"));
        if wants_gpu && self.config.proc_root.join("driver/nvidia").exists() {
            cmd.push("--gpus=all".to_string());
        }

        if virtual_memory_mb > 0 {
            debug!(memory_mb = virtual_memory_mb, "Setting maximum memory");
            cmd.push(format!("--memory={virtual_memory_mb}m"));
            cmd.push(format!("--memory-swap={virtual_memory_mb}m"));
        }

        if max_cpu_percent > 0 {
            debug!(cpu_percent = max_cpu_percent, "Setting CPU quota");
            let quota = u64::from(max_cpu_percent) * CPU_PERIOD_USEC / 100;
            cmd.push(format!("--cpu-period={CPU_PERIOD_USEC}"));
            cmd.push(format!("--cpu-quota={quota}"));
        }

        cmd.extend(container.volume_args());
        cmd.extend(container.tmpfs_args());
        cmd.extend(container.port_args());
        cmd.extend(container.env_args());
        cmd.push(container.image.clone());
        cmd.extend(container.command.iter().cloned());
        cmd
    }

    /// Start `container` detached, optionally limiting its memory and CPU.
    ///
    /// `max_cpu_percent` of 100 is one full core. A container that fails to
    /// start is removed again.
    pub async fn start(
        &self,
        container: &mut Container,
        virtual_memory_mb: u64,
        max_cpu_percent: u32,
    ) -> Result<(), DockError> {
        let cmd = self.run_arguments(container, virtual_memory_mb, max_cpu_percent);
        debug!(image = %container.image, command = %container.command.join(" "), "Starting container");

        let output = self.exec(cmd, None).await?;

        let id = output.stdout.trim();
        if !id.is_empty() {
            container.id = Some(id.to_string());
            self.containers.lock().push(id.to_string());
        }

        if !output.success() {
            error!(image = %container.image, stderr = %output.stderr, "Failed to create the container");
            if container.id.is_some()
                && let Err(e) = self.rm(container).await
            {
                warn!(container_id = ?container.id, error = %e, "Cannot remove the container that failed to start");
            }
            return Err(DockError::StartFailed(output.stderr));
        }

        debug!(container_id = ?container.id, "Container started");
        Ok(())
    }

    /// Wait for the container to exit.
    ///
    /// Returns the exit code, or `None` when the timeout elapsed (the
    /// container keeps running) or the wait failed.
    pub async fn wait(&self, container: &Container, timeout: Option<Duration>) -> Option<i32> {
        let id = container.id.as_deref()?;
        let output = self.exec(args(&["wait", id]), timeout).await.ok()?;
        if !output.success() {
            return None;
        }
        output.stdout.trim().parse().ok()
    }

    /// Runtime state of the container, e.g. `running` or `exited`.
    pub async fn status(&self, container: &Container) -> Option<String> {
        let id = container.id.as_deref()?;
        debug!(container_id = %id, "Inspecting container");
        let output = self.exec(args(&["inspect", id]), None).await.ok()?;
        if !output.success() {
            return None;
        }
        let state: Value = serde_json::from_str(&output.stdout).ok()?;
        state
            .get(0)?
            .pointer("/State/Status")?
            .as_str()
            .map(str::to_string)
    }

    /// Output of the container, empty when unavailable.
    pub async fn logs(&self, container: &Container) -> String {
        let Some(id) = container.id.as_deref() else {
            return String::new();
        };
        match self.exec(args(&["logs", id]), None).await {
            Ok(output) if output.success() => output.stdout.replace("\r\n", "\n"),
            _ => String::new(),
        }
    }

    async fn pid(&self, id: &str) -> Option<u32> {
        let output = self
            .exec(args(&["inspect", "--format", "{{.State.Pid}}", id]), None)
            .await
            .ok()?;
        if !output.success() {
            return None;
        }
        output.stdout.trim().parse().ok().filter(|pid| *pid > 0)
    }

    /// CPU and memory statistics of the container.
    ///
    /// CPU figures are the delta since the previous call for the same
    /// container (since zero on the first call). Missing data yields zeros.
    pub async fn statistics(&self, container: &Container) -> ContainerStatistics {
        let Some(id) = container.id.as_deref() else {
            return ContainerStatistics::default();
        };
        let location = match self.pid(id).await {
            Some(pid) => self.cgroups.locate(pid).await,
            None => None,
        };
        let Some(location) = location else {
            debug!(container_id = %id, "Could not determine cgroup path for statistics");
            return ContainerStatistics::default();
        };

        let sample = self.cgroups.cpu_sample(&location).await;
        let memory = self.cgroups.memory(&location).await;
        let previous = self.cpu_samples.lock().insert(id.to_string(), sample);

        ContainerStatistics {
            cpu: cpu_statistics(previous.as_ref(), &sample),
            memory,
        }
    }

    /// Kill the container if it is running.
    pub async fn kill(&self, container: &Container) -> Result<(), DockError> {
        if self.status(container).await.as_deref() == Some("running")
            && let Some(id) = container.id.as_deref()
        {
            self.exec(args(&["kill", id]), None).await?;
        }
        Ok(())
    }

    /// Remove the container, stopping it first if needed.
    pub async fn rm(&self, container: &mut Container) -> Result<(), DockError> {
        let Some(id) = container.id.clone() else {
            return Ok(());
        };
        self.remove_id(&id).await?;
        container.id = None;
        Ok(())
    }

    async fn remove_id(&self, id: &str) -> Result<(), DockError> {
        let mut existing = Container::new("", Vec::new());
        existing.id = Some(id.to_string());
        let status = self.status(&existing).await;
        if !matches!(status.as_deref(), Some("created" | "exited")) {
            warn!(container_id = %id, status = ?status, "Killing container before removal");
            self.exec(args(&["container", "stop", id]), None).await?;
        }

        debug!(container_id = %id, "Removing container");
        let output = self.exec(args(&["rm", id]), None).await?;
        if !output.success() {
            warn!(container_id = %id, stderr = %output.stderr, "Failed to remove container");
        }

        self.containers.lock().retain(|tracked| tracked != id);
        self.cpu_samples.lock().remove(id);
        Ok(())
    }

    /// Run a command to completion in a throw-away container.
    ///
    /// Returns the exit code and the output, or `(1, None)` on any failure.
    pub async fn run(&self, image: &str, command: Vec<String>) -> (i32, Option<String>) {
        let mut container = self.create_container(image, command);
        let result = match self.start(&mut container, 0, 0).await {
            Ok(()) => match self.wait(&container, None).await {
                Some(status) => (status, Some(self.logs(&container).await)),
                None => (1, None),
            },
            Err(e) => {
                warn!(image = %image, error = %e, "Failed to run container");
                (1, None)
            }
        };
        if let Err(e) = self.rm(&mut container).await {
            warn!(image = %image, error = %e, "Failed to remove container");
        }
        result
    }

    /// IP address of the container on its networks.
    pub async fn get_ipaddress(&self, container: &Container) -> Option<String> {
        let id = container.id.as_deref()?;
        let output = self
            .exec(
                args(&[
                    "inspect",
                    "--format",
                    "{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}",
                    id,
                ]),
                None,
            )
            .await
            .ok()?;
        if !output.success() {
            error!(container_id = %id, stderr = %output.stderr, "Failed to retrieve the ip address of the container");
            return None;
        }
        Some(output.stdout.replace('\n', ""))
    }

    /// Ids of the containers currently tracked.
    pub fn tracked_containers(&self) -> Vec<String> {
        self.containers.lock().clone()
    }

    /// Remove every tracked container and persist the images cache.
    pub async fn teardown(&self) {
        let ids = self.tracked_containers();
        for id in ids {
            if let Err(e) = self.remove_id(&id).await {
                warn!(container_id = %id, error = %e, "Failed to remove container on teardown");
            }
        }
        self.persist_images_cache();
    }

    /// Write the images cache to its file, if any.
    pub fn persist_images_cache(&self) {
        if let Some(path) = &self.config.images_cache
            && let Err(e) = self.images_cache.lock().persist(path)
        {
            warn!(path = %path.display(), error = %e, "Failed to persist images cache");
        }
    }

    pub(super) fn log_catalog(&self) {
        for (key, info) in &self.processing_environments {
            info!(environment = %key, image = %info.image, "Processing environment");
        }
        for (key, info) in &self.db_environments {
            info!(environment = %key, image = %info.image, "Database environment");
        }
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.persist_images_cache();
    }
}
