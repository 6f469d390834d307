// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for beat-core integration tests.
//!
//! Provides a declaration prefix and data cache on disk, plus an in-process
//! algorithm launcher whose "processes" are tokio tasks speaking the real
//! frame protocol to the message handlers over loopback TCP.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beat_core::data::{CachedDataSink, Record};
use beat_core::execution::{
    AlgorithmLauncher, AlgorithmProcess, AlgorithmRole, ExecutionError, Failure, LaunchRequest,
    ProcessLogs, ProcessOutput,
};
use beat_protocol::{AlgorithmCommand, Frame, FrameError, FramedStream};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// Number of records in the input data file.
pub const INPUT_RECORDS: u64 = 9;

/// Cache relative path of the input data.
pub const INPUT_PATH: &str = "inputs/numbers";

/// Prefix and cache folders living as long as the test.
pub struct TestEnvironment {
    pub prefix: PathBuf,
    pub cache: PathBuf,
    pub raw_data: PathBuf,
    _root: TempDir,
}

fn write_json(path: &Path, value: Value) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, serde_json::to_vec_pretty(&value).unwrap()).unwrap();
}

impl TestEnvironment {
    /// Create a prefix with a few algorithms and an input file of
    /// [`INPUT_RECORDS`] integers `0..9` in the cache.
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        let prefix = root.path().join("prefix");
        let cache = root.path().join("cache");
        let raw_data = root.path().join("raw");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::create_dir_all(&raw_data).unwrap();

        write_json(
            &prefix.join("dataformats/user/integer/1.json"),
            json!({ "value": "int32" }),
        );

        let integer = json!({ "type": "user/integer/1" });
        write_json(
            &prefix.join("algorithms/user/echo/1.json"),
            json!({
                "language": "python",
                "type": "sequential",
                "groups": [{
                    "inputs": { "in": integer },
                    "outputs": { "out": integer }
                }],
                "parameters": { "offset": { "type": "int32", "default": 1 } }
            }),
        );
        write_json(
            &prefix.join("algorithms/user/sum/1.json"),
            json!({
                "language": "python",
                "type": "sequential",
                "groups": [{ "inputs": { "in": integer } }],
                "results": { "sum": { "type": "int32" } }
            }),
        );
        write_json(
            &prefix.join("algorithms/user/loop_user/1.json"),
            json!({
                "language": "python",
                "type": "sequential_loop_user",
                "groups": [{
                    "inputs": { "in": integer },
                    "outputs": { "out": integer },
                    "loop": { "request": integer, "answer": integer }
                }]
            }),
        );
        write_json(
            &prefix.join("algorithms/user/loop_processor/1.json"),
            json!({
                "language": "python",
                "type": "sequential_loop_processor",
                "groups": [{
                    "inputs": { "in": integer },
                    "loop": { "request": integer, "answer": integer }
                }],
                "parameters": { "factor": { "type": "int32", "default": 2 } }
            }),
        );
        write_json(
            &prefix.join("databases/integers/1.json"),
            json!({
                "root_folder": raw_data.to_string_lossy(),
                "direct_rawdata_access": true
            }),
        );

        let mut sink = CachedDataSink::create(&cache, INPUT_PATH).unwrap();
        for i in 0..INPUT_RECORDS {
            sink.write(&Record {
                start: i,
                end: i,
                value: json!({ "value": i }),
            })
            .unwrap();
        }
        sink.close().unwrap();

        Self {
            prefix,
            cache,
            raw_data,
            _root: root,
        }
    }

    /// Input descriptor reading [`INPUT_PATH`] from the `integers/1` database.
    pub fn input(&self) -> Value {
        json!({
            "database": "integers/1",
            "protocol": "default",
            "set": "train",
            "output": "numbers",
            "path": INPUT_PATH,
            "channel": "main"
        })
    }

    /// `user/echo/1` block writing to `outputs/echo`.
    pub fn echo_block(&self) -> Value {
        json!({
            "algorithm": "user/echo/1",
            "channel": "main",
            "inputs": { "in": self.input() },
            "outputs": { "out": { "path": "outputs/echo", "channel": "main" } },
            "parameters": {}
        })
    }

    /// `user/sum/1` analysis block writing its result to `results/sum`.
    pub fn sum_block(&self) -> Value {
        json!({
            "algorithm": "user/sum/1",
            "channel": "main",
            "inputs": { "in": self.input() },
            "result": { "path": "results/sum" }
        })
    }

    /// `user/loop_user/1` block driven with `user/loop_processor/1`.
    pub fn loop_block(&self) -> Value {
        json!({
            "algorithm": "user/loop_user/1",
            "channel": "main",
            "inputs": { "in": self.input() },
            "outputs": { "out": { "path": "outputs/looped", "channel": "main" } },
            "loop": {
                "algorithm": "user/loop_processor/1",
                "inputs": { "in": self.input() },
                "parameters": { "factor": 10 }
            }
        })
    }

    /// Records of a cached data file.
    pub fn read_records(&self, relative: &str) -> Vec<Record> {
        let mut source = beat_core::data::CachedDataSource::open(&self.cache, relative).unwrap();
        let mut records = Vec::new();
        while let Some(record) = source.next_record().unwrap() {
            records.push(record);
        }
        records
    }

    /// Whether the data file of `relative` exists.
    pub fn data_exists(&self, relative: &str) -> bool {
        beat_core::data::data_file(&self.cache, relative).exists()
    }
}

/// What an in-process algorithm does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Writes every input value plus the `offset` parameter to `out`
    Echo,
    /// Writes the sum of the inputs to `result`
    Sum,
    /// Fails `stp` with a user error
    FailSetup,
    /// Fails `pre` with a user error
    FailPrepare,
    /// Writes a few records, then fails `prc` with a user error
    FailProcess,
    /// Never answers `prc`
    Hang,
    /// Exits with status 3 when asked to process
    Crash,
    /// Asks the loop algorithm for every value and writes the answers
    LoopUser,
    /// Answers loop requests with the value times `factor`
    LoopProcessor,
}

/// Launches [`Behaviour`]s as tokio tasks.
pub struct TaskLauncher {
    main: Behaviour,
    looped: Behaviour,
    launched: Mutex<Vec<LaunchRequest>>,
    configured: Mutex<Vec<bool>>,
    finished: Arc<Mutex<Vec<(AlgorithmRole, Option<i32>)>>>,
}

impl TaskLauncher {
    pub fn new(main: Behaviour) -> Arc<Self> {
        Self::with_loop(main, Behaviour::LoopProcessor)
    }

    pub fn with_loop(main: Behaviour, looped: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            main,
            looped,
            launched: Mutex::new(Vec::new()),
            configured: Mutex::new(Vec::new()),
            finished: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Every launch request, in order.
    pub fn launched(&self) -> Vec<LaunchRequest> {
        self.launched.lock().clone()
    }

    /// Whether `configuration.json` existed at each launch.
    pub fn configured(&self) -> Vec<bool> {
        self.configured.lock().clone()
    }

    /// Role and exit code of every reaped process, `None` when killed.
    pub fn finished(&self) -> Vec<(AlgorithmRole, Option<i32>)> {
        self.finished.lock().clone()
    }
}

#[async_trait]
impl AlgorithmLauncher for TaskLauncher {
    async fn launch(
        &self,
        request: &LaunchRequest,
    ) -> Result<Box<dyn AlgorithmProcess>, ExecutionError> {
        self.launched.lock().push(request.clone());
        self.configured
            .lock()
            .push(request.configuration_dir.join("configuration.json").is_file());

        let behaviour = match request.role {
            AlgorithmRole::Main => self.main,
            AlgorithmRole::Loop => self.looped,
        };
        let address = request
            .handler_address
            .trim_start_matches("tcp://")
            .to_string();
        let log = Arc::new(Mutex::new(String::new()));
        let task = tokio::spawn(run_algorithm(behaviour, address, log.clone()));

        Ok(Box::new(TaskProcess {
            role: request.role,
            task,
            exit: None,
            log,
            finished: self.finished.clone(),
        }))
    }
}

struct TaskProcess {
    role: AlgorithmRole,
    task: JoinHandle<i32>,
    exit: Option<Option<i32>>,
    log: Arc<Mutex<String>>,
    finished: Arc<Mutex<Vec<(AlgorithmRole, Option<i32>)>>>,
}

#[async_trait]
impl AlgorithmProcess for TaskProcess {
    async fn wait(&mut self) -> Option<i32> {
        if let Some(code) = self.exit {
            return code;
        }
        let code = (&mut self.task).await.ok();
        self.exit = Some(code);
        code
    }

    async fn kill(&mut self) {
        self.task.abort();
    }

    async fn finish(mut self: Box<Self>) -> ProcessOutput {
        if tokio::time::timeout(Duration::from_secs(5), self.wait())
            .await
            .is_err()
        {
            self.kill().await;
            self.wait().await;
        }
        let code = self.wait().await;
        self.finished.lock().push((self.role, code));
        ProcessOutput {
            logs: ProcessLogs::Split {
                stdout: self.log.lock().clone(),
                stderr: String::new(),
            },
            cpu: None,
            memory: None,
        }
    }
}

type Stream = FramedStream<TcpStream>;

fn ack() -> Frame {
    Frame::command_only(AlgorithmCommand::Ack.as_bytes())
}

fn failure(failure: Failure) -> Frame {
    Frame::command_only(AlgorithmCommand::Error.as_bytes()).with_part(failure.to_json())
}

/// Next input record, `None` once exhausted.
async fn next(stream: &mut Stream) -> Result<Option<Record>, FrameError> {
    let reply = stream
        .request(&Frame::command_only(AlgorithmCommand::Next.as_bytes()).with_part("in"))
        .await?;
    if reply.command() == Some(AlgorithmCommand::End.as_bytes()) {
        return Ok(None);
    }
    let record = serde_json::from_slice(reply.part(1)?)
        .map_err(|_| FrameError::Malformed("record"))?;
    Ok(Some(record))
}

async fn write(stream: &mut Stream, output: &str, record: &Record) -> Result<(), FrameError> {
    let reply = stream
        .request(
            &Frame::command_only(AlgorithmCommand::Write.as_bytes())
                .with_part(output.to_string())
                .with_part(serde_json::to_string(record).unwrap()),
        )
        .await?;
    match reply.command() {
        Some(command) if command == AlgorithmCommand::Ack.as_bytes() => Ok(()),
        _ => Err(FrameError::Malformed("write refused")),
    }
}

fn value(record: &Record) -> i64 {
    record.value["value"].as_i64().unwrap_or_default()
}

/// Process step of `behaviour`; the returned frame answers `prc`.
async fn process(
    behaviour: Behaviour,
    stream: &mut Stream,
    parameters: &Value,
    log: &Mutex<String>,
) -> Result<Frame, FrameError> {
    match behaviour {
        Behaviour::Echo => {
            let offset = parameters["offset"].as_i64().unwrap_or_default();
            let mut count = 0;
            while let Some(record) = next(stream).await? {
                let out = Record {
                    value: json!({ "value": value(&record) + offset }),
                    ..record
                };
                write(stream, "out", &out).await?;
                count += 1;
            }
            log.lock().push_str(&format!("echoed {count} records\n"));
            Ok(ack())
        }
        Behaviour::Sum => {
            let mut sum = 0;
            let mut last = 0;
            while let Some(record) = next(stream).await? {
                sum += value(&record);
                last = record.end;
            }
            let result = Record {
                start: 0,
                end: last,
                value: json!({ "sum": sum }),
            };
            write(stream, "result", &result).await?;
            Ok(ack())
        }
        Behaviour::FailProcess => {
            for _ in 0..3 {
                if let Some(record) = next(stream).await? {
                    write(stream, "out", &record).await?;
                }
            }
            Ok(failure(
                Failure::user("ZeroDivisionError", "division by zero")
                    .with_frame("/usr/lib/python3/runner.py", 10, "process", "")
                    .with_frame("/algorithms/user/echo/1.py", 7, "process", "return 1 / 0"),
            ))
        }
        Behaviour::LoopUser => {
            while let Some(record) = next(stream).await? {
                let reply = stream
                    .request(
                        &Frame::command_only(AlgorithmCommand::LoopRequest.as_bytes())
                            .with_part(json!({ "value": value(&record) }).to_string()),
                    )
                    .await?;
                let answer: Value = serde_json::from_slice(reply.part(1)?)
                    .map_err(|_| FrameError::Malformed("answer"))?;
                let out = Record {
                    value: json!({ "value": answer["answer"] }),
                    ..record
                };
                write(stream, "out", &out).await?;
            }
            Ok(ack())
        }
        Behaviour::LoopProcessor | Behaviour::FailSetup | Behaviour::FailPrepare => Ok(ack()),
        Behaviour::Hang | Behaviour::Crash => unreachable!("handled by the control loop"),
    }
}

/// Body of an in-process algorithm: connect, then serve control requests.
async fn run_algorithm(behaviour: Behaviour, address: String, log: Arc<Mutex<String>>) -> i32 {
    let Ok(socket) = TcpStream::connect(&address).await else {
        return 2;
    };
    let mut stream = FramedStream::new(socket);
    let mut parameters = Value::Null;

    loop {
        let Ok(frame) = stream.read_frame().await else {
            return 1;
        };
        let command = frame.command().map(AlgorithmCommand::try_from);
        let reply = match command {
            Some(Ok(AlgorithmCommand::Setup)) => {
                parameters = frame
                    .part(1)
                    .ok()
                    .and_then(|p| serde_json::from_slice(p).ok())
                    .unwrap_or(Value::Null);
                if behaviour == Behaviour::FailSetup {
                    failure(
                        Failure::user("ValueError", "bad parameter")
                            .with_frame("/algorithms/user/echo/1.py", 3, "setup", "raise ValueError"),
                    )
                } else {
                    ack()
                }
            }
            Some(Ok(AlgorithmCommand::Prepare)) if behaviour == Behaviour::FailPrepare => failure(
                Failure::user("RuntimeError", "cannot prepare")
                    .with_frame("/algorithms/user/echo/1.py", 5, "prepare", "raise RuntimeError"),
            ),
            Some(Ok(AlgorithmCommand::Prepare)) => ack(),
            Some(Ok(AlgorithmCommand::Process)) => match behaviour {
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                    return 0;
                }
                Behaviour::Crash => return 3,
                _ => match process(behaviour, &mut stream, &parameters, &log).await {
                    Ok(reply) => reply,
                    Err(_) => return 1,
                },
            },
            Some(Ok(AlgorithmCommand::LoopRequest)) => {
                let request: Value = frame
                    .part(1)
                    .ok()
                    .and_then(|p| serde_json::from_slice(p).ok())
                    .unwrap_or(Value::Null);
                let factor = parameters["factor"].as_i64().unwrap_or(1);
                let answer = request["value"].as_i64().unwrap_or_default() * factor;
                ack().with_part(json!({ "answer": answer }).to_string())
            }
            Some(Ok(AlgorithmCommand::Done)) => {
                let _ = stream.write_frame(&ack()).await;
                return 0;
            }
            _ => failure(Failure::system("ProtocolError", "unexpected command")),
        };
        if stream.write_frame(&reply).await.is_err() {
            return 1;
        }
    }
}

/// Skip a test unless `var` is set, printing why.
#[macro_export]
macro_rules! skip_unless_env {
    ($var:expr) => {
        match std::env::var($var) {
            Ok(value) if !value.is_empty() => value,
            _ => {
                eprintln!("Skipping test: {} not set", $var);
                return;
            }
        }
    };
}
