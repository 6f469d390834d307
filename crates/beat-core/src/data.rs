// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cached data files.
//!
//! A cached data file `<cache>/<path>.data` holds one JSON record per line:
//! `{"start": 0, "end": 0, "value": ...}`. Closing a sink writes the SHA-256
//! of the data file to `<cache>/<path>.data.checksum`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::hash;
use crate::stats::{DataStatistics, FileStatistics};

/// Extension of cached data files.
pub const DATA_EXTENSION: &str = ".data";

/// Extension of checksum files, appended to the data file name.
pub const CHECKSUM_EXTENSION: &str = ".checksum";

/// Name of the sink receiving an analyzer's result.
pub const RESULT_ENDPOINT: &str = "result";

/// One data record covering the indices `start..=end`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// First index covered
    pub start: u64,
    /// Last index covered
    pub end: u64,
    /// Payload
    pub value: Value,
}

/// Absolute location of the data file for a cache relative path.
pub fn data_file(cache: &Path, relative: &str) -> PathBuf {
    cache.join(format!("{relative}{DATA_EXTENSION}"))
}

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Reads records from a cached data file, one line at a time.
#[derive(Debug)]
pub struct CachedDataSource {
    relative: String,
    reader: BufReader<File>,
    line: String,
    bytes: u64,
    blocks: u64,
    time: f64,
}

impl CachedDataSource {
    /// Open `<cache>/<relative>.data`.
    pub fn open(cache: &Path, relative: &str) -> io::Result<Self> {
        let path = data_file(cache, relative);
        let file = File::open(&path).map_err(|e| {
            io::Error::new(e.kind(), format!("cannot open `{}': {e}", path.display()))
        })?;
        Ok(Self {
            relative: relative.to_string(),
            reader: BufReader::new(file),
            line: String::new(),
            bytes: 0,
            blocks: 0,
            time: 0.0,
        })
    }

    /// Cache relative path of the source.
    pub fn relative_path(&self) -> &str {
        &self.relative
    }

    /// Next record, or `None` once the file is exhausted.
    pub fn next_record(&mut self) -> io::Result<Option<Record>> {
        let started = Instant::now();
        loop {
            self.line.clear();
            let read = self.reader.read_line(&mut self.line)?;
            if read == 0 {
                self.time += started.elapsed().as_secs_f64();
                return Ok(None);
            }
            self.bytes += read as u64;
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(trimmed).map_err(|e| {
                invalid_data(format!("corrupted record in `{}': {e}", self.relative))
            })?;
            self.blocks += 1;
            self.time += started.elapsed().as_secs_f64();
            return Ok(Some(record));
        }
    }

    /// Read-side statistics.
    pub fn statistics(&self) -> DataStatistics {
        let mut stats = DataStatistics::default();
        stats.volume.read = self.bytes;
        stats.blocks.read = self.blocks;
        stats.time.read = self.time;
        stats
    }
}

/// Writes records to a cached data file.
#[derive(Debug)]
pub struct CachedDataSink {
    relative: String,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    last_end: Option<u64>,
    bytes: u64,
    blocks: u64,
    time: f64,
}

impl CachedDataSink {
    /// Create `<cache>/<relative>.data`, with its parent folders.
    pub fn create(cache: &Path, relative: &str) -> io::Result<Self> {
        let path = data_file(cache, relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        Ok(Self {
            relative: relative.to_string(),
            path,
            writer: Some(BufWriter::new(file)),
            last_end: None,
            bytes: 0,
            blocks: 0,
            time: 0.0,
        })
    }

    /// Cache relative path of the sink.
    pub fn relative_path(&self) -> &str {
        &self.relative
    }

    /// Append one record. Records must be ordered and not overlap.
    pub fn write(&mut self, record: &Record) -> io::Result<()> {
        let started = Instant::now();
        if record.end < record.start {
            return Err(invalid_data(format!(
                "record end {} precedes its start {}",
                record.end, record.start
            )));
        }
        if let Some(last) = self.last_end
            && record.start <= last
        {
            return Err(invalid_data(format!(
                "record starting at {} overlaps the previous one ending at {last}",
                record.start
            )));
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::other(format!("sink `{}' is closed", self.relative)))?;

        let mut line = serde_json::to_vec(record).map_err(io::Error::other)?;
        line.push(b'\n');
        writer.write_all(&line)?;

        self.last_end = Some(record.end);
        self.bytes += line.len() as u64;
        self.blocks += 1;
        self.time += started.elapsed().as_secs_f64();
        Ok(())
    }

    /// Whether the sink still accepts records.
    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Flush the data file and write its checksum. Closing twice is a no-op.
    pub fn close(&mut self) -> io::Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writer.flush()?;
        drop(writer);

        let checksum = hash::hash_file(&self.path)?;
        std::fs::write(self.checksum_path(), checksum)?;
        debug!(path = %self.relative, blocks = self.blocks, "Closed data sink");
        Ok(())
    }

    /// Close and delete the partial data written so far.
    pub fn discard(&mut self) {
        self.writer.take();
        for path in [self.path.clone(), self.checksum_path()] {
            if let Err(e) = std::fs::remove_file(&path)
                && e.kind() != io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), error = %e, "Failed to remove partial output");
            }
        }
    }

    fn checksum_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(CHECKSUM_EXTENSION);
        PathBuf::from(name)
    }

    /// Write-side statistics.
    pub fn statistics(&self) -> DataStatistics {
        let mut stats = DataStatistics::default();
        stats.volume.write = self.bytes;
        stats.blocks.write = self.blocks;
        stats.time.write = self.time;
        stats.files.push(FileStatistics {
            path: self.relative.clone(),
            volume: self.bytes,
            blocks: self.blocks,
        });
        stats
    }
}

impl Drop for CachedDataSink {
    fn drop(&mut self) {
        if self.is_open() {
            warn!(path = %self.relative, "Data sink dropped while open, discarding it");
            self.discard();
        }
    }
}

/// Data endpoints served to one algorithm process.
#[derive(Debug, Default)]
pub struct IoEndpoints {
    /// Inputs by name
    pub inputs: BTreeMap<String, CachedDataSource>,
    /// Outputs (or the analyzer result) by name
    pub outputs: BTreeMap<String, CachedDataSink>,
    /// Data format of each endpoint
    pub formats: BTreeMap<String, String>,
}

impl IoEndpoints {
    /// Description sent in reply to an `ifo` request.
    pub fn describe(&self) -> Value {
        let describe = |names: Vec<&String>| -> Value {
            names
                .into_iter()
                .map(|name| {
                    (
                        name.clone(),
                        json!({ "dataformat": self.formats.get(name) }),
                    )
                })
                .collect::<serde_json::Map<_, _>>()
                .into()
        };
        json!({
            "inputs": describe(self.inputs.keys().collect()),
            "outputs": describe(self.outputs.keys().collect()),
        })
    }

    /// Aggregated statistics of every endpoint.
    pub fn statistics(&self) -> DataStatistics {
        let mut total = DataStatistics::default();
        for source in self.inputs.values() {
            total += source.statistics();
        }
        for sink in self.outputs.values() {
            total += sink.statistics();
        }
        total
    }

    /// Close every sink; on failure partial outputs are discarded instead.
    pub fn close(&mut self, success: bool) -> io::Result<()> {
        let mut first_error = None;
        for sink in self.outputs.values_mut() {
            if success {
                if let Err(e) = sink.close() {
                    warn!(path = %sink.relative_path(), error = %e, "Failed to close data sink");
                    first_error.get_or_insert(e);
                }
            } else {
                sink.discard();
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_then_source() {
        let cache = tempfile::tempdir().unwrap();
        let mut sink = CachedDataSink::create(cache.path(), "ab/cd/ef/out").unwrap();
        for i in 0..3u64 {
            sink.write(&Record {
                start: i,
                end: i,
                value: json!({"value": i}),
            })
            .unwrap();
        }
        sink.close().unwrap();
        assert!(!sink.is_open());
        assert!(cache.path().join("ab/cd/ef/out.data.checksum").exists());

        let mut source = CachedDataSource::open(cache.path(), "ab/cd/ef/out").unwrap();
        let mut values = Vec::new();
        while let Some(record) = source.next_record().unwrap() {
            values.push(record.value["value"].as_u64().unwrap());
        }
        assert_eq!(values, vec![0, 1, 2]);
        assert_eq!(source.statistics().blocks.read, 3);
        assert_eq!(
            source.statistics().volume.read,
            sink.statistics().volume.write
        );
    }

    #[test]
    fn test_checksum_matches_content() {
        let cache = tempfile::tempdir().unwrap();
        let mut sink = CachedDataSink::create(cache.path(), "x/y").unwrap();
        sink.write(&Record {
            start: 0,
            end: 4,
            value: json!(1),
        })
        .unwrap();
        sink.close().unwrap();

        let data = std::fs::read(cache.path().join("x/y.data")).unwrap();
        let checksum = std::fs::read_to_string(cache.path().join("x/y.data.checksum")).unwrap();
        assert_eq!(checksum, hash::hash_bytes(&data));
    }

    #[test]
    fn test_overlapping_records_rejected() {
        let cache = tempfile::tempdir().unwrap();
        let mut sink = CachedDataSink::create(cache.path(), "x/y").unwrap();
        let record = Record {
            start: 0,
            end: 1,
            value: json!(0),
        };
        sink.write(&record).unwrap();
        assert!(sink.write(&record).is_err());
    }

    #[test]
    fn test_discard_removes_partial_output() {
        let cache = tempfile::tempdir().unwrap();
        let mut endpoints = IoEndpoints::default();
        endpoints.outputs.insert(
            "out".into(),
            CachedDataSink::create(cache.path(), "ab/out").unwrap(),
        );
        endpoints.close(false).unwrap();
        assert!(!cache.path().join("ab/out.data").exists());
    }

    #[test]
    fn test_dropping_open_sink_discards() {
        let cache = tempfile::tempdir().unwrap();
        let sink = CachedDataSink::create(cache.path(), "ab/out").unwrap();
        assert!(cache.path().join("ab/out.data").exists());
        drop(sink);
        assert!(!cache.path().join("ab/out.data").exists());
    }

    #[test]
    fn test_missing_source() {
        let cache = tempfile::tempdir().unwrap();
        let err = CachedDataSource::open(cache.path(), "nope").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
