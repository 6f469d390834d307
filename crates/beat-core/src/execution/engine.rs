// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The setup → prepare → process state machine shared by the executors.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use super::algorithm::{
    AlgorithmDriver, AlgorithmLauncher, AlgorithmProcess, AlgorithmRole, LaunchRequest,
    ProcessOutput,
};
use super::context::ExecutionContext;
use super::message_handler::{HandlerReport, MessageHandler};
use super::{ExecutionError, FailureKind};
use crate::stats::DataStatistics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Idle,
    HandlersStarted,
    ConfigExported,
    LoopSetup,
    LoopPrepared,
    LoopRunning,
    MainSetup,
    MainPrepared,
    MainProcessing,
    Done,
    Failed,
}

/// How one execution reaches its algorithm processes.
#[derive(Debug, Clone)]
pub(crate) struct EngineOptions {
    /// Address the handlers bind on
    pub bind_ip: IpAddr,
    /// Address the algorithm processes connect to
    pub advertised_ip: IpAddr,
    /// Ports the handlers may use
    pub port_range: Option<(u16, u16)>,
    /// Processing time limit
    pub timeout: Option<Duration>,
    /// Where the algorithm processes see the exported configuration, when
    /// not at its host location
    pub configuration_mount: Option<PathBuf>,
}

/// What came out of a run that got past setup and prepare.
#[derive(Debug, Default)]
pub(crate) struct EngineOutcome {
    pub status: i32,
    pub user_error: String,
    pub system_error: String,
    pub timed_out: bool,
    pub data: DataStatistics,
    pub main: Option<ProcessOutput>,
    pub looped: Option<ProcessOutput>,
}

#[derive(Debug, Default)]
struct Processing {
    status: i32,
    user_error: String,
    system_error: String,
    timed_out: bool,
}

struct Slot {
    handler: Option<MessageHandler>,
    process: Option<Box<dyn AlgorithmProcess>>,
    ready: bool,
}

impl Slot {
    fn empty() -> Self {
        Self {
            handler: None,
            process: None,
            ready: false,
        }
    }

    /// Tell a ready algorithm to exit, reap it and stop its handler.
    async fn release(&mut self) -> (Option<ProcessOutput>, Option<HandlerReport>) {
        let output = match (self.process.take(), &self.handler) {
            (Some(mut process), Some(handler)) => {
                if self.ready {
                    let acknowledged = AlgorithmDriver::new(handler.link(), process.as_mut())
                        .done()
                        .await;
                    if let Err(e) = acknowledged {
                        debug!(error = %e, "Algorithm did not acknowledge termination");
                        process.kill().await;
                    }
                } else {
                    process.kill().await;
                }
                Some(process.finish().await)
            }
            (Some(mut process), None) => {
                process.kill().await;
                Some(process.finish().await)
            }
            (None, _) => None,
        };
        self.ready = false;

        let report = match self.handler.take() {
            Some(handler) => Some(handler.stop().await),
            None => None,
        };
        (output, report)
    }
}

struct Session {
    phase: Phase,
    main: Slot,
    looped: Slot,
    workdir: Option<TempDir>,
}

fn advance(current: &mut Phase, next: Phase) {
    debug!(from = ?current, to = ?next, "Execution phase");
    *current = next;
}

fn setup_failure(error: ExecutionError, root: &str) -> ExecutionError {
    match error {
        ExecutionError::Algorithm(failure) => ExecutionError::Setup(failure.format(root)),
        other => other,
    }
}

/// Run the block of `context` through `launcher`.
///
/// Setup and prepare failures are returned as [`ExecutionError::Setup`];
/// a failing processing step is reported in the outcome. Teardown runs on
/// every path.
pub(crate) async fn run(
    context: &mut ExecutionContext,
    launcher: &dyn AlgorithmLauncher,
    options: &EngineOptions,
) -> Result<EngineOutcome, ExecutionError> {
    let mut session = Session {
        phase: Phase::Idle,
        main: Slot::empty(),
        looped: Slot::empty(),
        workdir: None,
    };

    let result = drive(context, launcher, options, &mut session).await;
    if result.is_err() {
        advance(&mut session.phase, Phase::Failed);
    }

    // Loop first: the main algorithm no longer needs it.
    let (looped, loop_report) = session.looped.release().await;
    let (main, main_report) = session.main.release().await;
    if let Some(workdir) = session.workdir.take()
        && let Err(e) = workdir.close()
    {
        warn!(error = %e, "Failed to remove the configuration directory");
    }

    let mut data = DataStatistics::default();
    let mut handler_user_error = None;
    let mut handler_system_error = None;
    let mut restore = |report: Option<HandlerReport>| {
        report.map(|report| {
            data += report.statistics;
            if handler_user_error.is_none() {
                handler_user_error = report.user_error;
            }
            if handler_system_error.is_none() {
                handler_system_error = report.system_error;
            }
            report.io
        })
    };
    let main_io = restore(main_report);
    let loop_io = restore(loop_report);
    context.restore_io(main_io, loop_io);

    let success = matches!(&result, Ok(processing) if processing.status == 0);
    let closed = context.close(success);
    data += context.io_statistics();

    let mut processing = result?;
    if let Err(e) = closed {
        error!(error = %e, "Failed to close the outputs");
        if processing.status == 0 {
            processing.status = 1;
        }
        if processing.system_error.is_empty() {
            processing.system_error = format!("cannot close outputs: {e}");
        }
    }
    if processing.status != 0 {
        if processing.user_error.is_empty()
            && let Some(user_error) = handler_user_error
        {
            processing.user_error = user_error;
        }
        if processing.system_error.is_empty()
            && let Some(system_error) = handler_system_error
        {
            processing.system_error = system_error;
        }
    }

    Ok(EngineOutcome {
        status: processing.status,
        user_error: processing.user_error,
        system_error: processing.system_error,
        timed_out: processing.timed_out,
        data,
        main,
        looped,
    })
}

async fn drive(
    context: &ExecutionContext,
    launcher: &dyn AlgorithmLauncher,
    options: &EngineOptions,
    session: &mut Session,
) -> Result<Processing, ExecutionError> {
    let (Some(block), Some(algorithm)) = (context.block(), context.algorithm()) else {
        return Err(ExecutionError::InvalidBlock(context.errors.clone()));
    };

    let (main_io, loop_io) = context.open_io()?;
    if let Some(loop_io) = loop_io {
        session.looped.handler =
            Some(MessageHandler::bind(options.bind_ip, options.port_range, loop_io, None).await?);
    }
    let loop_link = session.looped.handler.as_ref().map(MessageHandler::link);
    session.main.handler = Some(
        MessageHandler::bind(options.bind_ip, options.port_range, main_io, loop_link).await?,
    );
    advance(&mut session.phase, Phase::HandlersStarted);

    let workdir = tempfile::Builder::new().prefix("beat-").tempdir()?;
    context.dump_runner_configuration(workdir.path())?;
    let configuration_dir = workdir.path().to_path_buf();
    session.workdir = Some(workdir);
    advance(&mut session.phase, Phase::ConfigExported);

    let visible_dir = options
        .configuration_mount
        .clone()
        .unwrap_or_else(|| configuration_dir.clone());
    let root = visible_dir
        .join("prefix")
        .join("algorithms")
        .to_string_lossy()
        .into_owned();

    let address = |handler: &Option<MessageHandler>| {
        handler
            .as_ref()
            .map(|h| format!("tcp://{}:{}", options.advertised_ip, h.address().port()))
            .ok_or(ExecutionError::HandlerClosed)
    };

    if let (Some(loop_block), Some(loop_algorithm)) = (&block.loop_block, context.loop_algorithm())
    {
        let request = LaunchRequest {
            role: AlgorithmRole::Loop,
            handler_address: address(&session.looped.handler)?,
            configuration_dir: configuration_dir.clone(),
            cache: context.cache().to_path_buf(),
        };
        session.looped.process = Some(launcher.launch(&request).await?);
        let (Some(handler), Some(process)) =
            (&session.looped.handler, session.looped.process.as_mut())
        else {
            return Err(ExecutionError::HandlerClosed);
        };
        let mut driver = AlgorithmDriver::new(handler.link(), process.as_mut());

        advance(&mut session.phase, Phase::LoopSetup);
        let parameters = loop_algorithm.resolve_parameters(&loop_block.parameters);
        driver
            .setup(&parameters)
            .await
            .map_err(|e| setup_failure(e, &root))?;
        session.looped.ready = true;
        driver.prepare().await.map_err(|e| setup_failure(e, &root))?;
        advance(&mut session.phase, Phase::LoopPrepared);
        driver.process(None).await.map_err(|e| setup_failure(e, &root))?;
        advance(&mut session.phase, Phase::LoopRunning);
    }

    let request = LaunchRequest {
        role: AlgorithmRole::Main,
        handler_address: address(&session.main.handler)?,
        configuration_dir,
        cache: context.cache().to_path_buf(),
    };
    session.main.process = Some(launcher.launch(&request).await?);
    let (Some(handler), Some(process)) = (&session.main.handler, session.main.process.as_mut())
    else {
        return Err(ExecutionError::HandlerClosed);
    };
    let mut driver = AlgorithmDriver::new(handler.link(), process.as_mut());

    advance(&mut session.phase, Phase::MainSetup);
    let parameters = algorithm.resolve_parameters(&block.parameters);
    driver
        .setup(&parameters)
        .await
        .map_err(|e| setup_failure(e, &root))?;
    session.main.ready = true;
    driver.prepare().await.map_err(|e| setup_failure(e, &root))?;
    advance(&mut session.phase, Phase::MainPrepared);

    advance(&mut session.phase, Phase::MainProcessing);
    let started = Instant::now();
    let processed = driver.process(options.timeout).await;
    debug!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        algorithm = %algorithm.name,
        "Processing finished"
    );

    let processing = match processed {
        Ok(()) => Processing::default(),
        Err(ExecutionError::Algorithm(failure)) => {
            info!(failure = %failure, "Algorithm processing failed");
            let message = failure.format(&root);
            match failure.kind {
                FailureKind::User => Processing {
                    status: 1,
                    user_error: message,
                    ..Processing::default()
                },
                FailureKind::System => Processing {
                    status: 1,
                    system_error: message,
                    ..Processing::default()
                },
            }
        }
        Err(ExecutionError::Timeout(limit)) => {
            warn!(timeout_s = limit.as_secs(), "Processing timed out, killing the algorithm");
            drop(driver);
            process.kill().await;
            let code = process.wait().await;
            session.main.ready = false;
            Processing {
                status: code.filter(|c| *c != 0).unwrap_or(1),
                system_error: format!("Processing timed out after {} seconds", limit.as_secs()),
                timed_out: true,
                ..Processing::default()
            }
        }
        Err(ExecutionError::ProcessExited(code)) => {
            session.main.ready = false;
            Processing {
                status: code.filter(|c| *c != 0).unwrap_or(1),
                system_error: format!(
                    "Algorithm process exited unexpectedly with status {}",
                    code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
                ),
                ..Processing::default()
            }
        }
        Err(other) => return Err(other),
    };

    advance(&mut session.phase, Phase::Done);
    Ok(processing)
}
