// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Validation and resolution of one execution block.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use super::ExecutionError;
use crate::data::{CachedDataSink, CachedDataSource, IoEndpoints, RESULT_ENDPOINT};
use crate::declaration::{Algorithm, Database, DeclarationCaches};
use crate::schema::{self, ExecutionBlock, InputDescriptor, OutputDescriptor};
use crate::stats::DataStatistics;

/// Name of the exported block configuration.
pub const CONFIGURATION_FILE: &str = "configuration.json";

/// Where the block comes from.
#[derive(Debug, Clone)]
pub enum BlockSource {
    /// In-memory JSON
    Value(Value),
    /// JSON file
    File(PathBuf),
}

impl From<Value> for BlockSource {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<PathBuf> for BlockSource {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

impl From<&Path> for BlockSource {
    fn from(path: &Path) -> Self {
        Self::File(path.to_path_buf())
    }
}

/// A validated, fully resolved execution block.
///
/// Problems are collected in [`errors`](Self::errors) instead of being
/// raised; check [`valid`](Self::valid) before executing.
#[derive(Debug)]
pub struct ExecutionContext {
    prefix: PathBuf,
    cache: PathBuf,
    data: Value,
    block: Option<ExecutionBlock>,
    /// Validation problems
    pub errors: Vec<String>,
    algorithm: Option<Arc<Algorithm>>,
    loop_algorithm: Option<Arc<Algorithm>>,
    databases: BTreeMap<String, Arc<Database>>,
    exports: DeclarationCaches,
    io: Option<IoEndpoints>,
    loop_io: Option<IoEndpoints>,
}

impl ExecutionContext {
    /// Validate and resolve `data` against the declarations under `prefix`.
    ///
    /// Declarations are taken from (and added to) `caches`. Databases listed
    /// in `custom_root_folders` are served from the given folder instead of
    /// their declared one. Only a missing cache folder is an error.
    pub fn new(
        prefix: impl Into<PathBuf>,
        data: impl Into<BlockSource>,
        cache: impl Into<PathBuf>,
        caches: &mut DeclarationCaches,
        custom_root_folders: Option<&HashMap<String, String>>,
    ) -> Result<Self, ExecutionError> {
        let cache = cache.into();
        if !cache.is_dir() {
            return Err(ExecutionError::CacheNotFound(cache));
        }

        let mut context = Self {
            prefix: prefix.into(),
            cache,
            data: Value::Null,
            block: None,
            errors: Vec::new(),
            algorithm: None,
            loop_algorithm: None,
            databases: BTreeMap::new(),
            exports: DeclarationCaches::new(),
            io: None,
            loop_io: None,
        };
        context.resolve(data.into(), caches, custom_root_folders);

        context.exports.dataformats = caches.dataformats.clone();
        context.exports.libraries = caches.libraries.clone();

        if !context.errors.is_empty() {
            debug!(errors = ?context.errors, "Execution block is invalid");
        }
        Ok(context)
    }

    fn resolve(
        &mut self,
        source: BlockSource,
        caches: &mut DeclarationCaches,
        custom_root_folders: Option<&HashMap<String, String>>,
    ) {
        // 1. schema
        self.data = match source {
            BlockSource::Value(value) => value,
            BlockSource::File(path) => {
                match std::fs::read(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()))
                {
                    Ok(value) => value,
                    Err(e) => {
                        self.errors
                            .push(format!("cannot read execution block `{}': {e}", path.display()));
                        return;
                    }
                }
            }
        };
        self.errors.extend(schema::validate(&self.data));
        if !self.errors.is_empty() {
            return;
        }
        let block: ExecutionBlock = match serde_json::from_value(self.data.clone()) {
            Ok(block) => block,
            Err(e) => {
                self.errors.push(format!("invalid execution block: {e}"));
                return;
            }
        };

        // 2. primary algorithm
        let algorithm = caches.algorithm(&self.prefix, &block.algorithm);
        self.algorithm = Some(algorithm.clone());
        self.block = Some(block.clone());
        if !algorithm.valid() {
            self.errors.extend(algorithm.errors.iter().cloned());
            return;
        }

        // 3. loop algorithm
        if let Some(loop_block) = &block.loop_block {
            let loop_algorithm = caches.algorithm(&self.prefix, &loop_block.algorithm);
            self.loop_algorithm = Some(loop_algorithm.clone());
            if !loop_algorithm.valid() {
                self.errors.extend(loop_algorithm.errors.iter().cloned());
                return;
            }

            if loop_block.inputs.len() != loop_algorithm.input_map.len() {
                self.errors.push(format!(
                    "The number of inputs of the loop ({}) does not match the number of \
                     inputs of loop algorithm `{}' ({})",
                    loop_block.inputs.len(),
                    loop_algorithm.name,
                    loop_algorithm.input_map.len()
                ));
            }
            if loop_block.outputs.len() != loop_algorithm.output_map.len() {
                self.errors.push(format!(
                    "The number of outputs of the loop ({}) does not match the number of \
                     outputs of loop algorithm `{}' ({})",
                    loop_block.outputs.len(),
                    loop_algorithm.name,
                    loop_algorithm.output_map.len()
                ));
            }
            self.check_names("input", block.inputs.keys(), &algorithm.input_map, &algorithm.name);
            if let Some(outputs) = &block.outputs {
                self.check_names("output", outputs.keys(), &algorithm.output_map, &algorithm.name);
            }
            if !self.errors.is_empty() {
                return;
            }
        }

        // 4. arity
        if block.inputs.len() != algorithm.input_map.len() {
            self.errors.push(format!(
                "The number of inputs ({}) does not match the number of inputs of \
                 algorithm `{}' ({})",
                block.inputs.len(),
                algorithm.name,
                algorithm.input_map.len()
            ));
        }
        match &block.outputs {
            Some(outputs) if outputs.len() != algorithm.output_map.len() => {
                self.errors.push(format!(
                    "The number of outputs ({}) does not match the number of outputs of \
                     algorithm `{}' ({})",
                    outputs.len(),
                    algorithm.name,
                    algorithm.output_map.len()
                ));
            }
            None if !algorithm.output_map.is_empty() => {
                self.errors.push(format!(
                    "The block declares no outputs but algorithm `{}' declares {}",
                    algorithm.name,
                    algorithm.output_map.len()
                ));
            }
            _ => {}
        }
        if !self.errors.is_empty() {
            return;
        }

        // 5. unknown names
        self.check_names("input", block.inputs.keys(), &algorithm.input_map, &algorithm.name);
        if let Some(outputs) = &block.outputs {
            self.check_names("output", outputs.keys(), &algorithm.output_map, &algorithm.name);
        }
        if !self.errors.is_empty() {
            return;
        }

        // 6. loop endpoints
        if block.loop_block.is_some() {
            for endpoint in ["request", "answer"] {
                if !algorithm.loop_map.contains_key(endpoint) {
                    self.errors.push(format!(
                        "Algorithm `{}' does not declare the loop endpoint `{endpoint}'",
                        algorithm.name
                    ));
                }
            }
            if !self.errors.is_empty() {
                return;
            }
        }

        // 7. databases
        for name in block.databases() {
            let database = caches.database(&self.prefix, name);
            let database = match custom_root_folders.and_then(|roots| roots.get(name)) {
                Some(root) => Arc::new(database.with_root_folder(root)),
                None => database,
            };
            if !database.valid() {
                self.errors.extend(database.errors.iter().cloned());
            }
            self.databases.insert(name.to_string(), database);
        }
    }

    fn check_names<'a>(
        &mut self,
        kind: &str,
        names: impl Iterator<Item = &'a String>,
        declared: &BTreeMap<String, String>,
        algorithm: &str,
    ) {
        for name in names {
            if !declared.contains_key(name) {
                self.errors.push(format!(
                    "The {kind} `{name}' is not declared by algorithm `{algorithm}'"
                ));
            }
        }
    }

    /// Whether the block validated.
    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Raw block data, extras included.
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Typed block, once it passed schema validation.
    pub fn block(&self) -> Option<&ExecutionBlock> {
        self.block.as_ref()
    }

    /// Primary algorithm.
    pub fn algorithm(&self) -> Option<&Arc<Algorithm>> {
        self.algorithm.as_ref()
    }

    /// Loop algorithm, for loop blocks.
    pub fn loop_algorithm(&self) -> Option<&Arc<Algorithm>> {
        self.loop_algorithm.as_ref()
    }

    /// Databases referenced by the inputs.
    pub fn databases(&self) -> &BTreeMap<String, Arc<Database>> {
        &self.databases
    }

    /// Declaration prefix.
    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Data cache.
    pub fn cache(&self) -> &Path {
        &self.cache
    }

    /// Whether the block produces a result instead of outputs.
    pub fn analysis(&self) -> bool {
        self.block
            .as_ref()
            .is_some_and(|b| b.result.is_some() && b.outputs.is_none())
    }

    fn cache_exists(&self, relative: &str) -> bool {
        let base = self.cache.join(relative);
        let pattern = format!("{}*", glob::Pattern::escape(&base.to_string_lossy()));
        glob::glob(&pattern)
            .map(|mut paths| paths.any(|p| p.is_ok()))
            .unwrap_or(false)
    }

    /// Whether every output (or the result) is already in the cache.
    pub fn outputs_exist(&self) -> bool {
        let Some(block) = &self.block else {
            return false;
        };
        if let Some(result) = &block.result
            && block.outputs.is_none()
        {
            return self.cache_exists(&result.path);
        }
        block
            .outputs
            .iter()
            .flat_map(|outputs| outputs.values())
            .all(|output| self.cache_exists(&output.path))
    }

    /// I/O statistics of the endpoints served so far.
    pub fn io_statistics(&self) -> DataStatistics {
        let mut total = DataStatistics::default();
        for io in self.io.iter().chain(self.loop_io.iter()) {
            total += io.statistics();
        }
        total
    }

    fn endpoints(
        &self,
        inputs: &BTreeMap<String, InputDescriptor>,
        outputs: &BTreeMap<String, OutputDescriptor>,
        result: Option<&str>,
        algorithm: &Algorithm,
    ) -> std::io::Result<IoEndpoints> {
        let mut io = IoEndpoints::default();
        for (name, input) in inputs {
            io.inputs
                .insert(name.clone(), CachedDataSource::open(&self.cache, &input.path)?);
            if let Some(format) = algorithm.input_map.get(name) {
                io.formats.insert(name.clone(), format.clone());
            }
        }

        let mut create = |name: &str, path: &str, format: Option<&String>| {
            let sink = CachedDataSink::create(&self.cache, path)?;
            io.outputs.insert(name.to_string(), sink);
            if let Some(format) = format {
                io.formats.insert(name.to_string(), format.clone());
            }
            Ok::<_, std::io::Error>(())
        };
        let created = outputs
            .iter()
            .try_for_each(|(name, output)| {
                create(name, &output.path, algorithm.output_map.get(name))
            })
            .and_then(|()| match result {
                Some(path) => create(RESULT_ENDPOINT, path, None),
                None => Ok(()),
            });

        if let Err(e) = created {
            if let Err(close) = io.close(false) {
                debug!(error = %close, "Cannot discard the endpoints opened so far");
            }
            return Err(e);
        }
        Ok(io)
    }

    /// Open the data endpoints of the main algorithm and, for loop blocks,
    /// of the loop algorithm.
    pub fn open_io(&self) -> Result<(IoEndpoints, Option<IoEndpoints>), ExecutionError> {
        let (Some(block), Some(algorithm)) = (&self.block, &self.algorithm) else {
            return Err(ExecutionError::InvalidBlock(self.errors.clone()));
        };
        if !self.valid() {
            return Err(ExecutionError::InvalidBlock(self.errors.clone()));
        }

        let main = self.endpoints(
            &block.inputs,
            block.outputs.as_ref().unwrap_or(&BTreeMap::new()),
            block.result.as_ref().map(|r| r.path.as_str()),
            algorithm,
        )?;

        let looped = match (&block.loop_block, &self.loop_algorithm) {
            (Some(loop_block), Some(loop_algorithm)) => {
                match self.endpoints(&loop_block.inputs, &loop_block.outputs, None, loop_algorithm) {
                    Ok(io) => Some(io),
                    Err(e) => {
                        let mut main = main;
                        if let Err(close) = main.close(false) {
                            debug!(error = %close, "Cannot discard the main endpoints");
                        }
                        return Err(e.into());
                    }
                }
            }
            _ => None,
        };

        Ok((main, looped))
    }

    /// Hand the endpoints back once the algorithms are done with them.
    pub fn restore_io(&mut self, main: Option<IoEndpoints>, looped: Option<IoEndpoints>) {
        self.io = main;
        self.loop_io = looped;
    }

    /// Close every data sink; after a failure partial outputs are discarded.
    pub fn close(&mut self, success: bool) -> std::io::Result<()> {
        let mut result = Ok(());
        for io in self.io.iter_mut().chain(self.loop_io.iter_mut()) {
            if let Err(e) = io.close(success) {
                warn!(error = %e, "Failed to close outputs");
                result = Err(e);
            }
        }
        result
    }

    /// Export the resolved configuration to `directory`:
    /// `configuration.json` plus every needed declaration under `prefix/`.
    pub fn dump_runner_configuration(&self, directory: &Path) -> Result<(), ExecutionError> {
        let (Some(block), Some(algorithm)) = (&self.block, &self.algorithm) else {
            return Err(ExecutionError::InvalidBlock(self.errors.clone()));
        };

        let mut configuration = block.clone();
        configuration.parameters = algorithm.resolve_parameters(&block.parameters);
        if let (Some(loop_block), Some(loop_algorithm)) =
            (configuration.loop_block.as_mut(), &self.loop_algorithm)
        {
            loop_block.parameters = loop_algorithm.resolve_parameters(&loop_block.parameters);
        }

        std::fs::create_dir_all(directory)?;
        std::fs::write(
            directory.join(CONFIGURATION_FILE),
            serde_json::to_vec_pretty(&configuration)?,
        )?;

        let prefix = directory.join("prefix");
        algorithm.export(&prefix, &self.exports)?;
        if let Some(loop_algorithm) = &self.loop_algorithm {
            loop_algorithm.export(&prefix, &self.exports)?;
        }
        for database in self.databases.values() {
            database.export(&prefix)?;
        }
        debug!(directory = %directory.display(), "Exported runner configuration");
        Ok(())
    }
}
