// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution block descriptor: JSON schema validation and typed model.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const EXECUTION_SCHEMA: &str = include_str!("../schema/execution.json");

fn validator() -> Result<&'static jsonschema::Validator, String> {
    static VALIDATOR: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();
    VALIDATOR
        .get_or_init(|| {
            let schema: Value = serde_json::from_str(EXECUTION_SCHEMA)
                .map_err(|e| format!("execution schema is not valid JSON: {e}"))?;
            jsonschema::validator_for(&schema)
                .map_err(|e| format!("execution schema cannot be compiled: {e}"))
        })
        .as_ref()
        .map_err(Clone::clone)
}

/// Validate a block against the execution schema.
///
/// Returns every violation found, formatted as `<json-pointer>: <message>`.
pub fn validate(data: &Value) -> Vec<String> {
    match validator() {
        Ok(validator) => validator
            .iter_errors(data)
            .map(|error| {
                let location = error.instance_path.to_string();
                if location.is_empty() {
                    error.to_string()
                } else {
                    format!("{location}: {error}")
                }
            })
            .collect(),
        Err(message) => vec![message],
    }
}

/// A validated execution block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionBlock {
    /// Versioned algorithm name (`user/name/version`)
    pub algorithm: String,
    /// Named inputs
    pub inputs: BTreeMap<String, InputDescriptor>,
    /// Named outputs (absent for analysis blocks)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<BTreeMap<String, OutputDescriptor>>,
    /// Result of an analysis block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultDescriptor>,
    /// Algorithm parameters
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Runtime environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentRef>,
    /// Loop algorithm driven alongside the main one
    #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
    pub loop_block: Option<LoopBlock>,
    /// Scheduler queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    /// Number of parallel slots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nb_slots: Option<u32>,
    /// Synchronization channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Docker: `min:max` host ports for the message handler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range: Option<String>,
    /// Docker: cache location as seen by the docker daemon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_mount_point: Option<String>,
    /// Docker: uid the containers run as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasets_uid: Option<u32>,
    /// Docker: network the containers join
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,
}

/// Cache-addressed data source of one input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDescriptor {
    /// Database (`name/version`) the data comes from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// Database protocol
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Protocol set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<String>,
    /// Set output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Cache relative path
    pub path: String,
    /// Content hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Synchronization channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

/// Cache-addressed destination of one output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDescriptor {
    /// Cache relative path
    pub path: String,
    /// Content hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Synchronization channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Algorithm endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Destination of an analysis result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultDescriptor {
    /// Cache relative path
    pub path: String,
    /// Content hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Named, versioned runtime environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRef {
    /// Environment name
    pub name: String,
    /// Environment version
    pub version: String,
}

impl EnvironmentRef {
    /// Catalog key: `name (version)`.
    pub fn key(&self) -> String {
        format!("{} ({})", self.name, self.version)
    }
}

/// Loop sub-block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopBlock {
    /// Versioned loop algorithm name
    pub algorithm: String,
    /// Named inputs of the loop algorithm
    pub inputs: BTreeMap<String, InputDescriptor>,
    /// Named outputs of the loop algorithm
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputDescriptor>,
    /// Loop algorithm parameters
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Runtime environment of the loop algorithm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentRef>,
    /// Number of parallel slots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nb_slots: Option<u32>,
}

impl ExecutionBlock {
    /// Databases referenced by any input, main or loop.
    pub fn databases(&self) -> Vec<&str> {
        let loop_inputs = self.loop_block.iter().flat_map(|l| l.inputs.values());
        let mut names: Vec<&str> = self
            .inputs
            .values()
            .chain(loop_inputs)
            .filter_map(|input| input.database.as_deref())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Parse the `port_range` extra into `(min, max)`.
    pub fn port_range(&self) -> Option<(u16, u16)> {
        parse_port_range(self.port_range.as_deref()?)
    }
}

/// Parse a `min:max` port range.
pub fn parse_port_range(value: &str) -> Option<(u16, u16)> {
    let (min, max) = value.split_once(':')?;
    let min: u16 = min.trim().parse().ok()?;
    let max: u16 = max.trim().parse().ok()?;
    (min <= max).then_some((min, max))
}
