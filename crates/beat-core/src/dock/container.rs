// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container description, turned into `docker run` arguments by the host.

use std::collections::BTreeMap;

/// Default size of the `/tmp` and `/run` tmpfs mounts.
const DEFAULT_TMPFS_SIZE: &str = "500k";

/// A volume mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    /// Mount point inside the container
    pub bind: String,
    /// Mounted read-only
    pub read_only: bool,
}

/// A published port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    /// Host interface, all interfaces when absent
    pub host_address: Option<String>,
    /// Host port
    pub host_port: u16,
}

/// One runtime-managed process.
///
/// A container is constructed unstarted (`id` is `None`), gets its id from
/// [`Host::start`](super::Host::start) and loses it again on removal.
#[derive(Debug, Clone)]
pub struct Container {
    /// Image reference
    pub image: String,
    /// Command run in the container
    pub command: Vec<String>,
    /// Network to join
    pub network_name: Option<String>,
    /// User (and group) id the command runs as
    pub uid: Option<u32>,
    /// Runtime assigned id
    pub id: Option<String>,
    name: Option<String>,
    workdir: Option<String>,
    entrypoint: Option<String>,
    volumes: BTreeMap<String, VolumeBinding>,
    tmpfs: BTreeMap<String, String>,
    ports: BTreeMap<u16, PortBinding>,
    env: BTreeMap<String, String>,
}

impl Container {
    /// Unstarted container for `image`.
    pub fn new(image: impl Into<String>, command: Vec<String>) -> Self {
        let tmpfs = ["/tmp", "/run"]
            .into_iter()
            .map(|path| (path.to_string(), DEFAULT_TMPFS_SIZE.to_string()))
            .collect();
        Self {
            image: image.into(),
            command,
            network_name: None,
            uid: None,
            id: None,
            name: None,
            workdir: None,
            entrypoint: None,
            volumes: BTreeMap::new(),
            tmpfs,
            ports: BTreeMap::new(),
            env: BTreeMap::new(),
        }
    }

    /// Container name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Set the container name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    /// Set the working directory.
    pub fn set_workdir(&mut self, workdir: impl Into<String>) {
        self.workdir = Some(workdir.into());
    }

    /// Override the image entrypoint.
    pub fn set_entrypoint(&mut self, entrypoint: impl Into<String>) {
        self.entrypoint = Some(entrypoint.into());
    }

    /// Mount `path` (host path, `file://` or `nfs://addr:/path` URL) at `mount_path`.
    pub fn add_volume(&mut self, path: impl Into<String>, mount_path: impl Into<String>, read_only: bool) {
        self.volumes.insert(
            path.into(),
            VolumeBinding {
                bind: mount_path.into(),
                read_only,
            },
        );
    }

    /// Add (or resize) a tmpfs mount. An empty size means unbounded.
    pub fn add_tmpfs(&mut self, path: impl Into<String>, size: impl Into<String>) {
        self.tmpfs.insert(path.into(), size.into());
    }

    /// Publish `container_port` on `host_port`.
    pub fn add_port(&mut self, container_port: u16, host_port: u16, host_address: Option<&str>) {
        self.ports.insert(
            container_port,
            PortBinding {
                host_address: host_address.map(str::to_string),
                host_port,
            },
        );
    }

    /// Drop every published port.
    pub fn reset_ports(&mut self) {
        self.ports.clear();
    }

    /// Set an environment variable.
    pub fn add_environment_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.env.insert(name.into(), value.into());
    }

    /// Volume mount points by source.
    pub fn volumes(&self) -> &BTreeMap<String, VolumeBinding> {
        &self.volumes
    }

    /// Published ports.
    pub fn ports(&self) -> &BTreeMap<u16, PortBinding> {
        &self.ports
    }

    pub(crate) fn option_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(network) = &self.network_name {
            args.push(format!("--network={network}"));
        }
        if let Some(uid) = self.uid {
            args.push(format!("--user={uid}:{uid}"));
        }
        if let Some(name) = &self.name {
            args.push(format!("--name={name}"));
        }
        if let Some(workdir) = &self.workdir {
            args.push(format!("--workdir={workdir}"));
        }
        if let Some(entrypoint) = &self.entrypoint {
            args.push(format!("--entrypoint={entrypoint}"));
        }
        args
    }

    pub(crate) fn volume_args(&self) -> Vec<String> {
        self.volumes
            .iter()
            .map(|(source, binding)| {
                let mode = if binding.read_only { "ro" } else { "rw" };
                if let Some(nfs) = source.strip_prefix("nfs://") {
                    let (address, src) = nfs.split_once(':').unwrap_or((nfs, ""));
                    format!(
                        "--mount=type=volume,dst={},volume-driver=local,volume-opt=type=nfs,\
                         volume-opt=device=:{src},volume-opt=o=addr={address}",
                        binding.bind
                    )
                } else {
                    let source = source.strip_prefix("file://").unwrap_or(source);
                    format!("--volume={source}:{}:{mode}", binding.bind)
                }
            })
            .collect()
    }

    pub(crate) fn tmpfs_args(&self) -> Vec<String> {
        self.tmpfs
            .iter()
            .map(|(path, size)| {
                if size.is_empty() {
                    format!("--tmpfs={path}:rw,noexec,nosuid")
                } else {
                    format!("--tmpfs={path}:rw,noexec,nosuid,size={size}")
                }
            })
            .collect()
    }

    pub(crate) fn port_args(&self) -> Vec<String> {
        self.ports
            .iter()
            .flat_map(|(port, binding)| {
                let mapping = match &binding.host_address {
                    Some(address) => format!("{address}:{}:{port}", binding.host_port),
                    None => format!("{}:{port}", binding.host_port),
                };
                ["-p".to_string(), mapping]
            })
            .collect()
    }

    pub(crate) fn env_args(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(name, value)| format!("--env={name}={value}"))
            .collect()
    }

    /// Reproducible `docker run` command line, for debugging.
    pub fn command_line(&self) -> String {
        let mut parts = vec!["docker run -ti --rm=true".to_string()];
        parts.extend(self.option_args());
        parts.extend(self.volume_args());
        parts.extend(self.tmpfs_args());
        parts.extend(self.port_args());
        parts.extend(self.env_args());
        parts.push(self.image.clone());
        if !self.command.is_empty() {
            parts.push(format!("\"{}\"", self.command.join(" ")));
        }
        parts.join(" ")
    }
}
