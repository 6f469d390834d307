// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Beat Worker
//!
//! Connects to a scheduler and runs the execution blocks it sends, each in
//! its own process.
//!
//! Usage:
//!
//! ```text
//! beat-worker tcp://scheduler:5555 --prefix /beat/prefix --cache /beat/cache [--docker] [-vv]
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use beat_core::config::Config;
use beat_core::dock::{Host, HostConfig};
use beat_core::logging;
use beat_core::schema::parse_port_range;
use beat_core::worker::{JobRequest, TargetSpec, Worker, WorkerOptions, run_job_until};
use clap::Parser;
use tokio::io::AsyncReadExt;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "beat-worker", version)]
#[command(about = "Runs experiment blocks sent by a scheduler", long_about = None)]
struct Args {
    /// Scheduler address, e.g. tcp://127.0.0.1:5555
    #[arg(required_unless_present = "job_process")]
    scheduler_address: Option<String>,

    /// Name announced to the scheduler (default: host name)
    #[arg(short, long)]
    name: Option<String>,

    /// Declaration prefix
    #[arg(short, long, env = "BEAT_PREFIX", default_value = "prefix")]
    prefix: PathBuf,

    /// Data cache
    #[arg(short, long, env = "BEAT_CACHE", default_value = "cache")]
    cache: PathBuf,

    /// Run the algorithms inside docker containers
    #[arg(long)]
    docker: bool,

    /// Docker network of the algorithm containers
    #[arg(long)]
    docker_network: Option<String>,

    /// Ports the message handlers may use, `min:max`
    #[arg(long)]
    port_range: Option<String>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Run one job: request on stdin, outcome on stdout
    #[arg(long, hide = true)]
    job_process: bool,
}

fn default_name() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "beat-worker".to_string())
}

/// Set `stop` on SIGINT or SIGTERM.
fn install_signal_handlers(stop: Arc<AtomicBool>) -> anyhow::Result<()> {
    let mut interrupt = signal(SignalKind::interrupt()).context("cannot install SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => info!("Received SIGINT"),
            _ = terminate.recv() => info!("Received SIGTERM"),
        }
        stop.store(true, Ordering::SeqCst);
    });
    Ok(())
}

/// Child side of a job: read the request, run it, print the outcome.
async fn job_process(config: &Config) -> anyhow::Result<ExitCode> {
    let mut interrupt = signal(SignalKind::interrupt()).context("cannot install SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
    let cancelled = async move {
        tokio::select! {
            _ = interrupt.recv() => info!("Received SIGINT"),
            _ = terminate.recv() => info!("Received SIGTERM"),
        }
    };

    let mut input = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut input)
        .await
        .context("cannot read the job request")?;
    let request: JobRequest =
        serde_json::from_slice(&input).context("invalid job request")?;

    let job_id = request.job_id.clone();
    match run_job_until(request, config, cancelled).await {
        Some(outcome) => {
            info!(job_id = %job_id, "Job finished");
            println!("{}", serde_json::to_string(&outcome)?);
            Ok(ExitCode::SUCCESS)
        }
        None => {
            warn!(job_id = %job_id, "Job cancelled");
            Ok(ExitCode::FAILURE)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    logging::init(args.verbose);

    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!(error = %e, "No .env file loaded");
    }
    let config = Config::from_env()?;

    if args.job_process {
        return job_process(&config).await;
    }

    if !args.prefix.is_dir() {
        error!(prefix = %args.prefix.display(), "Prefix folder does not exist");
        return Ok(ExitCode::FAILURE);
    }
    if !args.cache.is_dir() {
        error!(cache = %args.cache.display(), "Cache folder does not exist");
        return Ok(ExitCode::FAILURE);
    }
    if let Some(range) = &args.port_range
        && parse_port_range(range).is_none()
    {
        error!(port_range = %range, "Invalid port range, expected `min:max`");
        return Ok(ExitCode::FAILURE);
    }
    let Some(scheduler_address) = args.scheduler_address else {
        error!("Missing scheduler address");
        return Ok(ExitCode::FAILURE);
    };

    let mut host = None;
    let target = if args.docker {
        let discovered = Host::new(HostConfig::from(&config))
            .await
            .context("cannot set up the docker host")?;
        info!(
            environments = discovered.processing_environments().len(),
            "Docker environments discovered"
        );
        let catalog = discovered.catalog();
        host = Some(discovered);
        TargetSpec::Container {
            catalog,
            network: args.docker_network,
            port_range: args.port_range,
        }
    } else {
        if args.docker_network.is_some() || args.port_range.is_some() {
            warn!("--docker-network and --port-range only apply with --docker");
        }
        TargetSpec::Local
    };

    let stop = Arc::new(AtomicBool::new(false));
    install_signal_handlers(stop.clone())?;

    let options = WorkerOptions {
        name: args.name.unwrap_or_else(default_name),
        scheduler_address,
        prefix: args.prefix,
        cache: args.cache,
        target,
        job_command: WorkerOptions::current_exe_job_command()?,
    };
    info!(
        worker = %options.name,
        scheduler = %options.scheduler_address,
        docker = args.docker,
        "Starting worker"
    );

    Worker::new(options, stop).run().await?;

    if let Some(host) = host {
        host.teardown().await;
    }
    Ok(ExitCode::SUCCESS)
}
