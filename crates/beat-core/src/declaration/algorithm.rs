// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Algorithm declarations.
//!
//! ```json
//! {
//!   "language": "python",
//!   "type": "sequential",
//!   "groups": [{
//!     "inputs":  {"in":  {"type": "user/integer/1"}},
//!     "outputs": {"out": {"type": "user/integer/1"}},
//!     "loop":    {"request": {"type": "user/integer/1"}, "answer": {"type": "user/integer/1"}}
//!   }],
//!   "parameters": {"offset": {"type": "int32", "default": 1}},
//!   "uses": {"lib": "user/lib/1"}
//! }
//! ```
//!
//! Analyzers declare `results` instead of group outputs.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use super::library::string_map;
use super::{DeclarationCaches, find_code_file, is_basic_type, read_declaration, split_name};

/// Execution model of an algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmType {
    /// Processes inputs one record at a time
    Sequential,
    /// Pulls its inputs itself
    Autonomous,
    /// Sequential algorithm that issues loop requests
    SequentialLoopUser,
    /// Autonomous algorithm that issues loop requests
    AutonomousLoopUser,
    /// Sequential algorithm answering loop requests
    SequentialLoopProcessor,
    /// Autonomous algorithm answering loop requests
    AutonomousLoopProcessor,
}

impl AlgorithmType {
    fn parse(value: Option<&str>) -> Option<Self> {
        Some(match value.unwrap_or("sequential") {
            "sequential" | "legacy" => AlgorithmType::Sequential,
            "autonomous" => AlgorithmType::Autonomous,
            "sequential_loop_user" => AlgorithmType::SequentialLoopUser,
            "autonomous_loop_user" => AlgorithmType::AutonomousLoopUser,
            "sequential_loop_processor" => AlgorithmType::SequentialLoopProcessor,
            "autonomous_loop_processor" => AlgorithmType::AutonomousLoopProcessor,
            _ => return None,
        })
    }

    /// Whether the algorithm answers loop requests.
    pub fn is_loop_processor(self) -> bool {
        matches!(
            self,
            AlgorithmType::SequentialLoopProcessor | AlgorithmType::AutonomousLoopProcessor
        )
    }
}

/// An algorithm declaration.
#[derive(Debug, Clone)]
pub struct Algorithm {
    /// Full name (`user/name/version`)
    pub name: String,
    /// Raw declaration
    pub data: Value,
    /// Execution model
    pub kind: AlgorithmType,
    /// Input name -> data format
    pub input_map: BTreeMap<String, String>,
    /// Output name -> data format
    pub output_map: BTreeMap<String, String>,
    /// Loop endpoint (`request`/`answer`) -> data format
    pub loop_map: BTreeMap<String, String>,
    /// Analyzer results: name -> type
    pub results: BTreeMap<String, String>,
    /// Parameter declarations
    pub parameters: Map<String, Value>,
    /// Used libraries: alias -> full name
    pub uses: BTreeMap<String, String>,
    /// Location of the declaration file
    pub declaration_path: Option<PathBuf>,
    /// Location of the code file
    pub code_path: Option<PathBuf>,
    /// Loading problems
    pub errors: Vec<String>,
}

impl Algorithm {
    fn invalid(name: &str, error: String) -> Self {
        Self {
            name: name.to_string(),
            data: Value::Null,
            kind: AlgorithmType::Sequential,
            input_map: BTreeMap::new(),
            output_map: BTreeMap::new(),
            loop_map: BTreeMap::new(),
            results: BTreeMap::new(),
            parameters: Map::new(),
            uses: BTreeMap::new(),
            declaration_path: None,
            code_path: None,
            errors: vec![error],
        }
    }

    /// Relative declaration path inside a prefix.
    pub fn relative_path(name: &str) -> Option<PathBuf> {
        let parts = split_name(name, 3)?;
        Some(
            Path::new("algorithms")
                .join(parts[0])
                .join(parts[1])
                .join(format!("{}.json", parts[2])),
        )
    }

    pub(crate) fn load(prefix: &Path, name: &str, caches: &mut DeclarationCaches) -> Self {
        let Some(relative) = Self::relative_path(name) else {
            return Self::invalid(name, format!("invalid algorithm name `{name}'"));
        };
        let path = prefix.join(relative);
        let data = match read_declaration(&path) {
            Ok(data) => data,
            Err(e) => return Self::invalid(name, format!("algorithm `{name}': {e}")),
        };

        let mut errors = Vec::new();
        let kind = AlgorithmType::parse(data.get("type").and_then(Value::as_str))
            .unwrap_or_else(|| {
                errors.push(format!("algorithm `{name}' has an unknown type"));
                AlgorithmType::Sequential
            });

        let mut input_map = BTreeMap::new();
        let mut output_map = BTreeMap::new();
        let mut loop_map = BTreeMap::new();

        let groups = data.get("groups").and_then(Value::as_array);
        match groups {
            Some(groups) if !groups.is_empty() => {
                for group in groups {
                    let mut collect = |kind, key, target: &mut BTreeMap<String, String>| {
                        collect_endpoints(name, kind, group.get(key), target, &mut errors)
                    };
                    collect("input", "inputs", &mut input_map);
                    collect("output", "outputs", &mut output_map);
                    collect("loop", "loop", &mut loop_map);
                }
            }
            _ => errors.push(format!("algorithm `{name}' declares no groups")),
        }

        let results: BTreeMap<String, String> = data
            .get("results")
            .and_then(Value::as_object)
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(|(k, v)| {
                        v.get("type")
                            .and_then(Value::as_str)
                            .map(|t| (k.clone(), t.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        if !results.is_empty() && !output_map.is_empty() {
            errors.push(format!(
                "algorithm `{name}' declares both results and outputs"
            ));
        }
        if kind.is_loop_processor() && loop_map.is_empty() {
            errors.push(format!(
                "loop processor `{name}' does not declare a loop endpoint"
            ));
        }
        for endpoint in loop_map.keys() {
            if endpoint != "request" && endpoint != "answer" {
                errors.push(format!(
                    "algorithm `{name}' declares an unknown loop endpoint `{endpoint}'"
                ));
            }
        }

        for format in input_map
            .values()
            .chain(output_map.values())
            .chain(loop_map.values())
            .chain(results.values())
        {
            if is_basic_type(format) {
                continue;
            }
            let dataformat = caches.dataformat(prefix, format);
            errors.extend(
                dataformat
                    .errors
                    .iter()
                    .map(|e| format!("algorithm `{name}': {e}")),
            );
        }

        let uses = string_map(data.get("uses"));
        for (alias, used) in &uses {
            let library = caches.library(prefix, used);
            errors.extend(
                library
                    .errors
                    .iter()
                    .map(|e| format!("algorithm `{name}' uses `{alias}' ({used}): {e}")),
            );
        }

        let parameters = data
            .get("parameters")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        Self {
            name: name.to_string(),
            kind,
            input_map,
            output_map,
            loop_map,
            results,
            parameters,
            uses,
            code_path: find_code_file(&path),
            declaration_path: Some(path),
            data,
            errors,
        }
    }

    /// Whether the declaration loaded without problems.
    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Whether the algorithm produces results rather than outputs.
    pub fn is_analyzer(&self) -> bool {
        !self.results.is_empty()
    }

    /// Parameter values: declared defaults overridden by `given`.
    pub fn resolve_parameters(&self, given: &Map<String, Value>) -> Map<String, Value> {
        let mut resolved: Map<String, Value> = self
            .parameters
            .iter()
            .filter_map(|(k, spec)| spec.get("default").map(|d| (k.clone(), d.clone())))
            .collect();
        for (k, v) in given {
            resolved.insert(k.clone(), v.clone());
        }
        resolved
    }

    /// Write the declaration, code, data formats and libraries under
    /// `target_prefix`.
    pub fn export(&self, target_prefix: &Path, caches: &DeclarationCaches) -> std::io::Result<()> {
        let (Some(source), Some(relative)) =
            (&self.declaration_path, Self::relative_path(&self.name))
        else {
            return Ok(());
        };
        super::export_files(source, self.code_path.as_deref(), &relative, target_prefix)?;

        for format in self
            .input_map
            .values()
            .chain(self.output_map.values())
            .chain(self.loop_map.values())
            .chain(self.results.values())
        {
            if let Some(dataformat) = caches.dataformats.get(format) {
                dataformat.export(target_prefix, caches)?;
            }
        }
        for used in self.uses.values() {
            if let Some(library) = caches.libraries.get(used) {
                library.export(target_prefix, caches)?;
            }
        }
        Ok(())
    }
}

fn collect_endpoints(
    algorithm: &str,
    kind: &str,
    value: Option<&Value>,
    target: &mut BTreeMap<String, String>,
    errors: &mut Vec<String>,
) {
    let Some(fields) = value.and_then(Value::as_object) else {
        return;
    };
    for (endpoint, spec) in fields {
        let Some(format) = spec.get("type").and_then(Value::as_str) else {
            errors.push(format!(
                "algorithm `{algorithm}': {kind} `{endpoint}' has no type"
            ));
            continue;
        };
        match target.entry(endpoint.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(format.to_string());
            }
            Entry::Occupied(_) => errors.push(format!(
                "algorithm `{algorithm}': {kind} `{endpoint}' is declared twice"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(prefix: &Path, relative: &str, content: Value) {
        let path = prefix.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content.to_string()).unwrap();
    }

    #[test]
    fn test_load_maps_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "dataformats/user/integer/1.json", json!({"value": "int32"}));
        write(
            dir.path(),
            "algorithms/user/echo/1.json",
            json!({
                "type": "sequential",
                "groups": [{
                    "inputs": {"in": {"type": "user/integer/1"}},
                    "outputs": {"out": {"type": "user/integer/1"}}
                }],
                "parameters": {"offset": {"type": "int32", "default": 1},
                               "scale": {"type": "int32"}}
            }),
        );

        let mut caches = DeclarationCaches::new();
        let algorithm = caches.algorithm(dir.path(), "user/echo/1");
        assert!(algorithm.valid(), "{:?}", algorithm.errors);
        assert_eq!(algorithm.input_map["in"], "user/integer/1");
        assert_eq!(algorithm.output_map["out"], "user/integer/1");
        assert!(!algorithm.is_analyzer());
        assert!(caches.dataformats.contains_key("user/integer/1"));

        let given = json!({"scale": 3}).as_object().cloned().unwrap();
        let parameters = algorithm.resolve_parameters(&given);
        assert_eq!(parameters["offset"], json!(1));
        assert_eq!(parameters["scale"], json!(3));
    }

    #[test]
    fn test_duplicate_endpoints_and_missing_formats() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "algorithms/user/broken/1.json",
            json!({
                "groups": [
                    {"inputs": {"in": {"type": "user/nowhere/1"}}},
                    {"inputs": {"in": {"type": "int32"}}}
                ]
            }),
        );

        let mut caches = DeclarationCaches::new();
        let algorithm = caches.algorithm(dir.path(), "user/broken/1");
        assert!(algorithm.errors.iter().any(|e| e.contains("declared twice")));
        assert!(algorithm.errors.iter().any(|e| e.contains("user/nowhere/1")));
        assert_eq!(algorithm.input_map["in"], "user/nowhere/1");
    }

    #[test]
    fn test_analyzer_results() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "algorithms/user/analyzer/1.json",
            json!({
                "groups": [{"inputs": {"in": {"type": "int32"}}}],
                "results": {"score": {"type": "float32", "display": true}}
            }),
        );

        let mut caches = DeclarationCaches::new();
        let algorithm = caches.algorithm(dir.path(), "user/analyzer/1");
        assert!(algorithm.valid(), "{:?}", algorithm.errors);
        assert!(algorithm.is_analyzer());
    }
}
