// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database declarations.

use std::path::{Path, PathBuf};

use serde_json::Value;

use super::{read_declaration, split_name};
use crate::schema::EnvironmentRef;

/// A database declaration.
#[derive(Debug, Clone)]
pub struct Database {
    /// Full name (`name/version`)
    pub name: String,
    /// Raw declaration
    pub data: Value,
    /// Folder holding the raw data
    pub root_folder: Option<PathBuf>,
    /// Environment able to serve this database
    pub environment: Option<EnvironmentRef>,
    /// Whether algorithms may read the raw data folder directly
    pub direct_rawdata_access: bool,
    /// Location of the declaration file
    pub declaration_path: Option<PathBuf>,
    /// Loading problems
    pub errors: Vec<String>,
}

impl Database {
    fn invalid(name: &str, error: String) -> Self {
        Self {
            name: name.to_string(),
            data: Value::Null,
            root_folder: None,
            environment: None,
            direct_rawdata_access: false,
            declaration_path: None,
            errors: vec![error],
        }
    }

    pub(crate) fn load(prefix: &Path, name: &str) -> Self {
        let Some(parts) = split_name(name, 2) else {
            return Self::invalid(name, format!("invalid database name `{name}'"));
        };
        let path = prefix
            .join("databases")
            .join(parts[0])
            .join(format!("{}.json", parts[1]));

        let data = match read_declaration(&path) {
            Ok(data) => data,
            Err(e) => return Self::invalid(name, format!("database `{name}': {e}")),
        };

        let mut errors = Vec::new();
        let root_folder = data
            .get("root_folder")
            .and_then(Value::as_str)
            .map(PathBuf::from);
        if root_folder.is_none() {
            errors.push(format!("database `{name}' has no root folder"));
        }

        let environment = match data.get("environment") {
            None | Some(Value::Null) => None,
            Some(value) => match serde_json::from_value(value.clone()) {
                Ok(environment) => Some(environment),
                Err(e) => {
                    errors.push(format!("database `{name}' has an invalid environment: {e}"));
                    None
                }
            },
        };

        Self {
            name: name.to_string(),
            root_folder,
            environment,
            direct_rawdata_access: data
                .get("direct_rawdata_access")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            declaration_path: Some(path),
            data,
            errors,
        }
    }

    /// Copy of this database served from another root folder.
    pub fn with_root_folder(&self, root_folder: impl Into<PathBuf>) -> Self {
        let root_folder = root_folder.into();
        let mut copy = self.clone();
        if let Some(fields) = copy.data.as_object_mut() {
            fields.insert(
                "root_folder".to_string(),
                Value::String(root_folder.to_string_lossy().into_owned()),
            );
        }
        copy.errors.retain(|e| !e.ends_with("has no root folder"));
        copy.root_folder = Some(root_folder);
        copy
    }

    /// Whether the declaration loaded without problems.
    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Whether `protocol`/`set` is declared.
    pub fn has_set(&self, protocol: &str, set: &str) -> bool {
        self.data
            .get("protocols")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter(|p| p.get("name").and_then(Value::as_str) == Some(protocol))
            .flat_map(|p| p.get("sets").and_then(Value::as_array).into_iter().flatten())
            .any(|s| s.get("name").and_then(Value::as_str) == Some(set))
    }

    /// Write the (possibly overridden) declaration under `target_prefix`.
    pub fn export(&self, target_prefix: &Path) -> std::io::Result<()> {
        let Some(parts) = split_name(&self.name, 2) else {
            return Ok(());
        };
        let target = target_prefix
            .join("databases")
            .join(parts[0])
            .join(format!("{}.json", parts[1]));
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_vec_pretty(&self.data).map_err(std::io::Error::other)?;
        std::fs::write(target, content)
    }
}
