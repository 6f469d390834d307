// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Named, versioned declarations stored under a prefix.
//!
//! Layout:
//! - `algorithms/<user>/<name>/<version>.json` (+ code file with the same stem)
//! - `databases/<name>/<version>.json`
//! - `libraries/<user>/<name>/<version>.json` (+ code file with the same stem)
//! - `dataformats/<user>/<name>/<version>.json`
//!
//! Loading never fails: problems are collected in each declaration's `errors`.
//! Loaded declarations are shared through [`DeclarationCaches`].

mod algorithm;
mod database;
mod dataformat;
mod library;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

pub use algorithm::{Algorithm, AlgorithmType};
pub use database::Database;
pub use dataformat::{DataFormat, is_basic_type};
pub use library::Library;

/// Caches of loaded declarations, keyed by full name.
///
/// A cache outlives the executions that borrow it; entries are loaded on
/// first use and reused afterwards.
#[derive(Debug, Default)]
pub struct DeclarationCaches {
    /// Data formats
    pub dataformats: HashMap<String, Arc<DataFormat>>,
    /// Databases
    pub databases: HashMap<String, Arc<Database>>,
    /// Algorithms
    pub algorithms: HashMap<String, Arc<Algorithm>>,
    /// Libraries
    pub libraries: HashMap<String, Arc<Library>>,
    loading: HashSet<String>,
}

impl DeclarationCaches {
    /// Create empty caches.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get an algorithm, loading it on a cache miss.
    pub fn algorithm(&mut self, prefix: &Path, name: &str) -> Arc<Algorithm> {
        if let Some(found) = self.algorithms.get(name) {
            return found.clone();
        }
        let loaded = Arc::new(Algorithm::load(prefix, name, self));
        self.algorithms.insert(name.to_string(), loaded.clone());
        loaded
    }

    /// Get a database, loading it on a cache miss.
    pub fn database(&mut self, prefix: &Path, name: &str) -> Arc<Database> {
        if let Some(found) = self.databases.get(name) {
            return found.clone();
        }
        let loaded = Arc::new(Database::load(prefix, name));
        self.databases.insert(name.to_string(), loaded.clone());
        loaded
    }

    /// Get a library, loading it on a cache miss.
    pub fn library(&mut self, prefix: &Path, name: &str) -> Arc<Library> {
        if let Some(found) = self.libraries.get(name) {
            return found.clone();
        }
        let key = format!("library:{name}");
        if !self.loading.insert(key.clone()) {
            return Arc::new(Library::invalid(
                name,
                format!("library `{name}' uses itself (circular dependency)"),
            ));
        }
        let loaded = Arc::new(Library::load(prefix, name, self));
        self.loading.remove(&key);
        self.libraries.insert(name.to_string(), loaded.clone());
        loaded
    }

    /// Get a data format, loading it on a cache miss.
    pub fn dataformat(&mut self, prefix: &Path, name: &str) -> Arc<DataFormat> {
        if let Some(found) = self.dataformats.get(name) {
            return found.clone();
        }
        let key = format!("dataformat:{name}");
        if !self.loading.insert(key.clone()) {
            return Arc::new(DataFormat::invalid(
                name,
                format!("dataformat `{name}' references itself (circular dependency)"),
            ));
        }
        let loaded = Arc::new(DataFormat::load(prefix, name, self));
        self.loading.remove(&key);
        self.dataformats.insert(name.to_string(), loaded.clone());
        loaded
    }
}

/// Read and parse a JSON declaration file.
pub(crate) fn read_declaration(path: &Path) -> Result<Value, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read `{}': {e}", path.display()))?;
    serde_json::from_str(&content)
        .map_err(|e| format!("cannot parse `{}': {e}", path.display()))
}

/// Split `a/b/c` into exactly `parts` components.
pub(crate) fn split_name(name: &str, parts: usize) -> Option<Vec<&str>> {
    let components: Vec<&str> = name.split('/').collect();
    (components.len() == parts && components.iter().all(|c| !c.is_empty() && *c != ".."))
        .then_some(components)
}

/// Code files stored next to a declaration (same stem, other extension).
pub(crate) fn find_code_file(declaration: &Path) -> Option<PathBuf> {
    let parent = declaration.parent()?;
    let stem = declaration.file_stem()?.to_str()?;
    let pattern = format!(
        "{}/{}.*",
        glob::Pattern::escape(&parent.to_string_lossy()),
        glob::Pattern::escape(stem)
    );
    glob::glob(&pattern)
        .ok()?
        .filter_map(Result::ok)
        .find(|path| path.extension().is_some_and(|ext| ext != "json"))
}

/// Copy a declaration (and its code file) into an exported prefix.
pub(crate) fn export_files(
    source: &Path,
    code: Option<&Path>,
    relative: &Path,
    target_prefix: &Path,
) -> std::io::Result<()> {
    let target = target_prefix.join(relative);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(source, &target)?;
    if let (Some(code), Some(parent)) = (code, target.parent())
        && let Some(file_name) = code.file_name()
    {
        std::fs::copy(code, parent.join(file_name))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_name() {
        assert_eq!(split_name("user/echo/1", 3), Some(vec!["user", "echo", "1"]));
        assert_eq!(split_name("user/echo", 3), None);
        assert_eq!(split_name("user/../1", 3), None);
        assert_eq!(split_name("integers/1", 2), Some(vec!["integers", "1"]));
    }

    #[test]
    fn test_find_code_file() {
        let dir = tempfile::tempdir().unwrap();
        let declaration = dir.path().join("1.json");
        std::fs::write(&declaration, "{}").unwrap();
        assert!(find_code_file(&declaration).is_none());

        std::fs::write(dir.path().join("1.py"), "pass").unwrap();
        std::fs::write(dir.path().join("2.py"), "pass").unwrap();
        assert_eq!(find_code_file(&declaration), Some(dir.path().join("1.py")));
    }

    #[test]
    fn test_missing_declarations_are_cached_with_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut caches = DeclarationCaches::new();
        let first = caches.algorithm(dir.path(), "user/missing/1");
        assert!(!first.valid());
        let second = caches.algorithm(dir.path(), "user/missing/1");
        assert!(Arc::ptr_eq(&first, &second));
    }
}
