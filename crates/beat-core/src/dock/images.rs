// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment metadata and the persisted images cache.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Catalog key of an environment: `"name (version)"`.
pub fn build_env_name(name: &str, version: &str) -> String {
    format!("{name} ({version})")
}

/// Metadata describing one environment image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    /// Environment name
    pub name: String,
    /// Environment version
    pub version: String,
    /// Revision of the version, e.g. `r2`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    /// Image reference providing the environment
    #[serde(default)]
    pub image: String,
    /// Databases served (database environments only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub databases: Option<Vec<String>>,
    /// Advertised capabilities, e.g. `gpu`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    /// Custom tmpfs mounts (path to size)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_tmpfs: BTreeMap<String, String>,
    /// Any other described field
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EnvironmentInfo {
    /// Catalog key.
    pub fn key(&self) -> String {
        build_env_name(&self.name, &self.version)
    }

    /// Version followed by the revision, used to order duplicates.
    pub fn full_version(&self) -> String {
        format!("{}{}", self.version, self.revision.as_deref().unwrap_or(""))
    }

    /// Whether the image advertises `capability`.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities
            .as_ref()
            .is_some_and(|caps| caps.iter().any(|c| c == capability))
    }
}

/// Image metadata keyed by image reference, optionally persisted as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImagesCache {
    entries: BTreeMap<String, EnvironmentInfo>,
}

impl ImagesCache {
    /// Load the cache from `path`; a missing or unreadable file yields an empty cache.
    pub fn load(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(content) => match serde_json::from_slice(&content) {
                Ok(cache) => {
                    debug!(path = %path.display(), "Loaded images cache");
                    cache
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring corrupted images cache");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Write the cache to `path`.
    pub fn persist(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, content)
    }

    /// Cached metadata of `image`.
    pub fn get(&self, image: &str) -> Option<&EnvironmentInfo> {
        self.entries.get(image)
    }

    /// Record the metadata of `image`.
    pub fn insert(&mut self, image: impl Into<String>, info: EnvironmentInfo) {
        self.entries.insert(image.into(), info);
    }

    /// Number of cached images.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A parsed environment version such as `1.2.0`, `2.0rc1` or `1.0.0r2`.
///
/// Releases compare numerically (trailing zeros ignored). Within a release,
/// pre-releases `a` < `b` < `rc` sort before the final release, which sorts
/// before revisions (`r`, `post`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct EnvVersion {
    release: Vec<u64>,
    phase: u8,
    serial: u64,
}

const PHASE_ALPHA: u8 = 0;
const PHASE_BETA: u8 = 1;
const PHASE_CANDIDATE: u8 = 2;
const PHASE_FINAL: u8 = 3;
const PHASE_REVISION: u8 = 4;

impl EnvVersion {
    /// Parse a version string, `None` when it does not look like one.
    pub fn parse(version: &str) -> Option<Self> {
        let version = version.trim();
        let version = version.strip_prefix('v').unwrap_or(version);

        let digits_end = |s: &str| s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());

        let mut release = Vec::new();
        let mut rest = version;
        loop {
            let end = digits_end(rest);
            if end == 0 {
                return None;
            }
            release.push(rest[..end].parse().ok()?);
            rest = &rest[end..];
            match rest.strip_prefix('.') {
                Some(next) if next.starts_with(|c: char| c.is_ascii_digit()) => rest = next,
                _ => break,
            }
        }
        while release.len() > 1 && release.last() == Some(&0) {
            release.pop();
        }

        let suffix = rest
            .trim_start_matches(['.', '-', '_'])
            .to_ascii_lowercase();
        let label_end = suffix
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(suffix.len());
        let (label, number) = suffix.split_at(label_end);
        let phase = match label {
            "" if number.is_empty() => PHASE_FINAL,
            "a" | "alpha" => PHASE_ALPHA,
            "b" | "beta" => PHASE_BETA,
            "c" | "rc" | "pre" | "preview" => PHASE_CANDIDATE,
            "r" | "rev" | "post" => PHASE_REVISION,
            _ => return None,
        };
        let serial = if number.is_empty() {
            0
        } else if number.chars().all(|c| c.is_ascii_digit()) {
            number.parse().ok()?
        } else {
            return None;
        };

        Some(Self {
            release,
            phase,
            serial,
        })
    }
}

/// Compare two version strings; unparseable ones compare as plain strings.
pub(crate) fn compare_versions(a: &str, b: &str) -> Ordering {
    match (EnvVersion::parse(a), EnvVersion::parse(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Outcome of comparing the tags of two images providing the same environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TagPreference {
    /// Keep the new image
    Replace,
    /// Keep the registered image
    Keep,
    /// No basis to decide
    Unknown,
}

fn image_tag(image: &str) -> Option<&str> {
    let last = image.rsplit('/').next().unwrap_or(image);
    last.split_once(':').map(|(_, tag)| tag)
}

fn numeric_tag(tag: &str) -> Option<Vec<u64>> {
    tag.split('.').map(|part| part.parse().ok()).collect()
}

/// Tag heuristic: `latest` wins, then the greater numeric tag; a
/// non-numeric tag loses against a numeric one.
pub(crate) fn prefer_new_tag(new_image: &str, registered_image: &str) -> TagPreference {
    match (image_tag(new_image), image_tag(registered_image)) {
        (Some(new), Some(old)) => {
            if new == "latest" {
                return TagPreference::Replace;
            }
            if old == "latest" {
                return TagPreference::Keep;
            }
            match (numeric_tag(new), numeric_tag(old)) {
                (None, _) => TagPreference::Keep,
                (Some(_), None) => TagPreference::Replace,
                (Some(new), Some(old)) if new > old => TagPreference::Replace,
                _ => TagPreference::Keep,
            }
        }
        (Some(_), None) => TagPreference::Replace,
        (None, Some(_)) => TagPreference::Keep,
        (None, None) => TagPreference::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_ordering() {
        assert_eq!(compare_versions("1.0.0r2", "1.0.0r1"), Ordering::Greater);
        assert_eq!(compare_versions("1.0.0", "1.0.0r1"), Ordering::Less);
        assert_eq!(compare_versions("1.0", "1.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("2.0rc1", "2.0"), Ordering::Less);
        assert_eq!(compare_versions("2.0b1", "2.0a3"), Ordering::Greater);
    }

    #[test]
    fn test_unparseable_versions_compare_as_strings() {
        assert!(EnvVersion::parse("latest").is_none());
        assert_eq!(compare_versions("beta", "alpha"), Ordering::Greater);
    }

    #[test]
    fn test_tag_preference() {
        assert_eq!(
            prefer_new_tag("beat/env:latest", "beat/env:2.0.0"),
            TagPreference::Replace
        );
        assert_eq!(
            prefer_new_tag("beat/env:2.0.0", "beat/env:latest"),
            TagPreference::Keep
        );
        assert_eq!(
            prefer_new_tag("beat/env:1.10", "beat/env:1.9"),
            TagPreference::Replace
        );
        assert_eq!(
            prefer_new_tag("beat/env:dev", "beat/env:1.0"),
            TagPreference::Keep
        );
        assert_eq!(
            prefer_new_tag("registry:5000/env", "registry:5000/other"),
            TagPreference::Unknown
        );
    }

    #[test]
    fn test_cache_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/images.json");

        let mut cache = ImagesCache::default();
        cache.insert(
            "beat/python:1.0",
            EnvironmentInfo {
                name: "Python".into(),
                version: "1.0".into(),
                image: "beat/python:1.0".into(),
                capabilities: Some(vec!["gpu".into()]),
                ..Default::default()
            },
        );
        cache.persist(&path).unwrap();

        let loaded = ImagesCache::load(&path);
        assert_eq!(loaded, cache);
        assert!(loaded.get("beat/python:1.0").unwrap().has_capability("gpu"));
        assert!(ImagesCache::load(&dir.path().join("missing.json")).is_empty());
    }
}
