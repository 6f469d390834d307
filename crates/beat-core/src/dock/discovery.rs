// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment discovery.
//!
//! Environments are found from image labels (`beat.env.*`) first. When no
//! labelled image exists, every image whose reference mentions `beat.env.`
//! is asked to `describe` itself.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::DockError;
use super::host::{Catalog, Host};
use super::images::{EnvironmentInfo, TagPreference, compare_versions, prefer_new_tag};

#[derive(Debug, Deserialize)]
struct InspectedImage {
    #[serde(rename = "RepoTags", default)]
    repo_tags: Option<Vec<String>>,
    #[serde(rename = "Config", default)]
    config: Option<ImageConfig>,
}

#[derive(Debug, Deserialize)]
struct ImageConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

/// Parse a list label, either JSON or a Python literal list.
fn parse_label_list(value: &str) -> Option<Vec<String>> {
    serde_json::from_str::<Vec<String>>(value)
        .or_else(|_| serde_json::from_str::<Vec<String>>(&value.replace('\'', "\"")))
        .map_err(|e| warn!(value = %value, error = %e, "Ignoring unparseable list label"))
        .ok()
}

fn parse_image_info(image: &str, labels: &HashMap<String, String>) -> Option<EnvironmentInfo> {
    let mut info = EnvironmentInfo {
        image: image.to_string(),
        name: labels.get("beat.env.name")?.clone(),
        version: labels.get("beat.env.version")?.clone(),
        revision: labels.get("beat.env.revision").cloned(),
        ..EnvironmentInfo::default()
    };

    if let Some(databases) = labels.get("beat.env.databases").filter(|v| !v.is_empty()) {
        info.databases = parse_label_list(databases);
    }
    if let Some(capabilities) = labels
        .get("beat.env.capabilities")
        .filter(|v| !v.is_empty())
    {
        info.capabilities = parse_label_list(capabilities);
    }
    if let Some(custom_tmpfs) = labels.get("beat.env.custom_tmpfs") {
        match serde_json::from_str::<BTreeMap<String, String>>(custom_tmpfs) {
            Ok(tmpfs) => info.custom_tmpfs = tmpfs,
            Err(e) => warn!(image = %image, error = %e, "Ignoring invalid custom tmpfs label"),
        }
    }
    Some(info)
}

impl Host {
    /// Build the environment catalogs, replacing the current ones.
    pub async fn discover_environments(&mut self) -> Result<(), DockError> {
        let (mut processing, mut databases) = self.discover_using_labels().await?;
        if processing.is_empty() && databases.is_empty() {
            (processing, databases) = self.discover_using_describe().await?;
        }

        debug!(
            environments = processing.len(),
            db_environments = databases.len(),
            "Discovered environments"
        );
        self.processing_environments = processing;
        self.db_environments = databases;
        self.log_catalog();
        Ok(())
    }

    fn discovery_failure(&self, message: String) -> Result<(), DockError> {
        if self.config.raise_on_errors {
            return Err(DockError::Discovery(message));
        }
        error!(reason = %message, "Docker error");
        Ok(())
    }

    /// Images labelled `beat.env.type=<kind>`; `None` after a tolerated failure.
    async fn images_with_type(&self, kind: &str) -> Result<Option<Vec<InspectedImage>>, DockError> {
        let output = self
            .exec(
                vec![
                    "images".to_string(),
                    "--filter".to_string(),
                    format!("label=beat.env.type={kind}"),
                    "--format".to_string(),
                    "{{.ID}}".to_string(),
                ],
                None,
            )
            .await?;
        if !output.success() {
            self.discovery_failure(output.stderr)?;
            return Ok(None);
        }

        let mut ids: Vec<String> = Vec::new();
        for id in output.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if !ids.iter().any(|known| known == id) {
                ids.push(id.to_string());
            }
        }
        if ids.is_empty() {
            return Ok(Some(Vec::new()));
        }

        let mut cmd = vec!["image".to_string(), "inspect".to_string()];
        cmd.extend(ids);
        let output = self.exec(cmd, None).await?;
        if !output.success() {
            self.discovery_failure(output.stderr)?;
            return Ok(None);
        }
        match serde_json::from_str(&output.stdout) {
            Ok(images) => Ok(Some(images)),
            Err(e) => {
                self.discovery_failure(format!("cannot parse image inspection: {e}"))?;
                Ok(None)
            }
        }
    }

    async fn discover_using_labels(&self) -> Result<(Catalog, Catalog), DockError> {
        let Some(databases) = self.images_with_type("database").await? else {
            return Ok(Default::default());
        };
        let db_environments = self.process_labelled_images(databases)?;

        let Some(executors) = self.images_with_type("execution").await? else {
            return Ok(Default::default());
        };
        let environments = self.process_labelled_images(executors)?;

        Ok((environments, db_environments))
    }

    fn process_labelled_images(&self, images: Vec<InspectedImage>) -> Result<Catalog, DockError> {
        let mut environments = Catalog::new();

        for image in images {
            let tags = image.repo_tags.unwrap_or_default();
            let Some(image_name) = tags.first() else {
                warn!("Untagged image, skipping");
                continue;
            };
            let labels = image
                .config
                .and_then(|config| config.labels)
                .unwrap_or_default();
            let Some(info) = parse_image_info(image_name, &labels) else {
                warn!(image = %image_name, "Image lacks the beat.env name or version labels, skipping");
                continue;
            };
            let key = info.key();

            match environments.get(&key) {
                Some(current) => {
                    if !tags.contains(&current.image) {
                        warn!(
                            current = %current.image,
                            candidate = ?tags,
                            "Different images providing the same environment"
                        );
                        if self.config.raise_on_errors {
                            return Err(DockError::Conflict {
                                first: image_name.clone(),
                                second: current.image.clone(),
                                key,
                            });
                        }
                        debug!("Keeping more recent");
                    }
                    if compare_versions(&info.full_version(), &current.full_version())
                        == Ordering::Greater
                    {
                        info!(environment = %key, image = %image_name, "Updated");
                        self.images_cache.lock().insert(image_name.clone(), info.clone());
                        environments.insert(key, info);
                    }
                }
                None => {
                    info!(environment = %key, image = %image_name, "Registered");
                    self.images_cache.lock().insert(image_name.clone(), info.clone());
                    environments.insert(key, info);
                }
            }
        }

        Ok(environments)
    }

    async fn describe(&self, image: &str) -> Result<Option<EnvironmentInfo>, DockError> {
        if let Some(info) = self.images_cache.lock().get(image) {
            return Ok(Some(info.clone()));
        }

        let cmd = ["run", "--rm=true", image, "describe"]
            .into_iter()
            .map(str::to_string)
            .collect();
        let output = self.exec(cmd, None).await?;
        if !output.success() {
            warn!(
                image = %image,
                status = ?output.status,
                stdout = %output.stdout,
                stderr = %output.stderr,
                "Describe failed"
            );
            return Ok(None);
        }

        match serde_json::from_str::<EnvironmentInfo>(&output.stdout) {
            Ok(info) => {
                self.images_cache.lock().insert(image, info.clone());
                Ok(Some(info))
            }
            Err(e) => {
                warn!(image = %image, error = %e, "Ignoring potential environment since `describe' output cannot be parsed");
                Ok(None)
            }
        }
    }

    fn must_replace(&self, image: &str, registered: &str, key: &str) -> Result<bool, DockError> {
        if self.config.raise_on_errors {
            return Err(DockError::Conflict {
                first: image.to_string(),
                second: registered.to_string(),
                key: key.to_string(),
            });
        }

        Ok(match prefer_new_tag(image, registered) {
            TagPreference::Replace => {
                debug!(environment = %key, image = %registered, "Overriding existing environment");
                true
            }
            TagPreference::Keep => {
                debug!(environment = %key, image = %registered, "Environment already exists, keeping it");
                false
            }
            TagPreference::Unknown => {
                warn!(
                    environment = %key,
                    image = %registered,
                    "Overriding existing environment. Make sure your docker images \
                     do not contain environments with the same names"
                );
                true
            }
        })
    }

    async fn discover_using_describe(&self) -> Result<(Catalog, Catalog), DockError> {
        let mut environments = Catalog::new();
        let mut db_environments = Catalog::new();

        let cmd = ["images", "--format", "{{.Repository}}:{{.Tag}}"]
            .into_iter()
            .map(str::to_string)
            .collect();
        let output = self.exec(cmd, None).await?;
        if !output.success() {
            error!(stderr = %output.stderr, "Failed to retrieve the list of docker images");
            return Ok((environments, db_environments));
        }

        let images: Vec<&str> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| line.contains("beat.env."))
            .collect();

        for image in images {
            let Some(mut description) = self.describe(image).await? else {
                debug!(image = %image, "Description not found");
                continue;
            };
            description.image = image.to_string();
            let key = description.key();

            let target = if description.databases.is_some() {
                &mut db_environments
            } else {
                &mut environments
            };
            if let Some(current) = target.get(&key)
                && !self.must_replace(image, &current.image, &key)?
            {
                continue;
            }
            info!(environment = %key, image = %image, "Registered");
            target.insert(key, description);
        }

        Ok((environments, db_environments))
    }
}
