// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Library declarations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use super::{DeclarationCaches, find_code_file, read_declaration, split_name};

/// A library declaration.
#[derive(Debug, Clone)]
pub struct Library {
    /// Full name (`user/name/version`)
    pub name: String,
    /// Programming language
    pub language: Option<String>,
    /// Used libraries: alias -> full name
    pub uses: BTreeMap<String, String>,
    /// Location of the declaration file
    pub declaration_path: Option<PathBuf>,
    /// Location of the code file
    pub code_path: Option<PathBuf>,
    /// Loading problems
    pub errors: Vec<String>,
}

impl Library {
    pub(crate) fn invalid(name: &str, error: String) -> Self {
        Self {
            name: name.to_string(),
            language: None,
            uses: BTreeMap::new(),
            declaration_path: None,
            code_path: None,
            errors: vec![error],
        }
    }

    pub(crate) fn load(prefix: &Path, name: &str, caches: &mut DeclarationCaches) -> Self {
        let Some(parts) = split_name(name, 3) else {
            return Self::invalid(name, format!("invalid library name `{name}'"));
        };
        let path = prefix
            .join("libraries")
            .join(parts[0])
            .join(parts[1])
            .join(format!("{}.json", parts[2]));

        let data = match read_declaration(&path) {
            Ok(data) => data,
            Err(e) => return Self::invalid(name, format!("library `{name}': {e}")),
        };

        let uses = string_map(data.get("uses"));
        let mut errors = Vec::new();
        for (alias, used) in &uses {
            let library = caches.library(prefix, used);
            errors.extend(
                library
                    .errors
                    .iter()
                    .map(|e| format!("library `{name}' uses `{alias}' ({used}): {e}")),
            );
        }

        Self {
            name: name.to_string(),
            language: data.get("language").and_then(Value::as_str).map(String::from),
            uses,
            code_path: find_code_file(&path),
            declaration_path: Some(path),
            errors,
        }
    }

    /// Whether the declaration loaded without problems.
    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Write the declaration, code and used libraries under `target_prefix`.
    pub fn export(&self, target_prefix: &Path, caches: &DeclarationCaches) -> std::io::Result<()> {
        let Some(source) = &self.declaration_path else {
            return Ok(());
        };
        super::export_files(
            source,
            self.code_path.as_deref(),
            &Path::new("libraries").join(format!("{}.json", self.name)),
            target_prefix,
        )?;
        for used in self.uses.values() {
            if let Some(library) = caches.libraries.get(used) {
                library.export(target_prefix, caches)?;
            }
        }
        Ok(())
    }
}

/// Read an object of string values, ignoring anything else.
pub(crate) fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|fields| {
            fields
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}
