// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data format declarations.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde_json::Value;

use super::{DeclarationCaches, read_declaration, split_name};

const BASIC_TYPES: &[&str] = &[
    "int8",
    "int16",
    "int32",
    "int64",
    "uint8",
    "uint16",
    "uint32",
    "uint64",
    "float32",
    "float64",
    "complex64",
    "complex128",
    "bool",
    "string",
];

/// Whether `name` is a built-in type that needs no declaration.
pub fn is_basic_type(name: &str) -> bool {
    BASIC_TYPES.contains(&name)
}

/// A data format declaration.
#[derive(Debug, Clone)]
pub struct DataFormat {
    /// Full name (`user/name/version`)
    pub name: String,
    /// Raw declaration
    pub data: Value,
    /// Other data formats this one references
    pub references: BTreeSet<String>,
    /// Location of the declaration file
    pub declaration_path: Option<PathBuf>,
    /// Loading problems
    pub errors: Vec<String>,
}

impl DataFormat {
    pub(crate) fn invalid(name: &str, error: String) -> Self {
        Self {
            name: name.to_string(),
            data: Value::Null,
            references: BTreeSet::new(),
            declaration_path: None,
            errors: vec![error],
        }
    }

    pub(crate) fn load(prefix: &Path, name: &str, caches: &mut DeclarationCaches) -> Self {
        let Some(parts) = split_name(name, 3) else {
            return Self::invalid(name, format!("invalid dataformat name `{name}'"));
        };
        let path = prefix
            .join("dataformats")
            .join(parts[0])
            .join(parts[1])
            .join(format!("{}.json", parts[2]));

        let data = match read_declaration(&path) {
            Ok(data) => data,
            Err(e) => return Self::invalid(name, format!("dataformat `{name}': {e}")),
        };

        let mut errors = Vec::new();
        if !data.is_object() {
            errors.push(format!("dataformat `{name}' must be a JSON object"));
        }

        let mut references = BTreeSet::new();
        collect_references(&data, &mut references);
        for reference in &references {
            let loaded = caches.dataformat(prefix, reference);
            errors.extend(
                loaded
                    .errors
                    .iter()
                    .map(|e| format!("dataformat `{name}' references `{reference}': {e}")),
            );
        }

        Self {
            name: name.to_string(),
            data,
            references,
            declaration_path: Some(path),
            errors,
        }
    }

    /// Whether the declaration loaded without problems.
    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Write the declaration under `target_prefix`.
    pub fn export(&self, target_prefix: &Path, caches: &DeclarationCaches) -> std::io::Result<()> {
        let Some(source) = &self.declaration_path else {
            return Ok(());
        };
        super::export_files(
            source,
            None,
            &Path::new("dataformats").join(format!("{}.json", self.name)),
            target_prefix,
        )?;
        for reference in &self.references {
            if let Some(dependency) = caches.dataformats.get(reference) {
                dependency.export(target_prefix, caches)?;
            }
        }
        Ok(())
    }
}

fn collect_references(value: &Value, references: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            if !is_basic_type(s) && split_name(s, 3).is_some() {
                references.insert(s.clone());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, references)),
        Value::Object(fields) => {
            for (key, v) in fields {
                if key.starts_with('#') && key != "#extends" {
                    continue;
                }
                collect_references(v, references);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collect_references() {
        let mut refs = BTreeSet::new();
        collect_references(
            &json!({
                "#description": "a/b/1 is not a reference here",
                "#extends": "user/base/1",
                "value": "int32",
                "points": [0, "user/point/2"]
            }),
            &mut refs,
        );
        assert_eq!(
            refs.into_iter().collect::<Vec<_>>(),
            vec!["user/base/1".to_string(), "user/point/2".to_string()]
        );
    }

    #[test]
    fn test_missing_reference_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("dataformats/user/pair/1");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(
            dir.path().join("dataformats/user/pair/1.json"),
            r#"{"first": "user/missing/1"}"#,
        )
        .unwrap();

        let mut caches = DeclarationCaches::new();
        let format = caches.dataformat(dir.path(), "user/pair/1");
        assert!(!format.valid());
        assert!(format.errors[0].contains("user/missing/1"));
    }

    #[test]
    fn test_self_reference_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("dataformats/user/node")).unwrap();
        std::fs::write(
            dir.path().join("dataformats/user/node/1.json"),
            r#"{"next": "user/node/1"}"#,
        )
        .unwrap();

        let mut caches = DeclarationCaches::new();
        let format = caches.dataformat(dir.path(), "user/node/1");
        assert!(format.errors.iter().any(|e| e.contains("circular")));
    }
}
