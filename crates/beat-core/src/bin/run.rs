// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Beat Run
//!
//! Runs a single execution block file, locally or in docker, and prints a
//! summary of the resources it used.
//!
//! Usage:
//!
//! ```text
//! beat-run block.json --prefix /beat/prefix --cache /beat/cache [--docker] [--force]
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use beat_core::config::Config;
use beat_core::declaration::DeclarationCaches;
use beat_core::dock::{Host, HostConfig};
use beat_core::execution::{ExecutionContext, ExecutionTarget};
use beat_core::logging;
use clap::Parser;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "beat-run", version)]
#[command(about = "Runs one experiment block", long_about = None)]
struct Args {
    /// Execution block JSON file
    block: PathBuf,

    /// Declaration prefix
    #[arg(short, long, env = "BEAT_PREFIX", default_value = "prefix")]
    prefix: PathBuf,

    /// Data cache
    #[arg(short, long, env = "BEAT_CACHE", default_value = "cache")]
    cache: PathBuf,

    /// Run the algorithms inside docker containers
    #[arg(long)]
    docker: bool,

    /// Run even when the outputs already exist
    #[arg(short, long)]
    force: bool,

    /// Do not print the statistics
    #[arg(short, long)]
    quiet: bool,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    logging::init(args.verbose);

    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!(error = %e, "No .env file loaded");
    }
    let config = Config::from_env()?;

    let mut caches = DeclarationCaches::new();
    let mut context = ExecutionContext::new(
        &args.prefix,
        args.block.as_path(),
        &args.cache,
        &mut caches,
        None,
    )?;
    if !context.valid() {
        eprintln!("Failed to load execution information:");
        for problem in &context.errors {
            eprintln!("  * {problem}");
        }
        return Ok(ExitCode::FAILURE);
    }

    if context.outputs_exist() && !args.force {
        info!(block = %args.block.display(), "Outputs already exist, use --force to run again");
        println!("Skipping execution: outputs already exist");
        return Ok(ExitCode::SUCCESS);
    }

    let target = if args.docker {
        let host = Host::new(HostConfig::from(&config))
            .await
            .context("cannot set up the docker host")?;
        ExecutionTarget::Container(Arc::new(host))
    } else {
        ExecutionTarget::Local
    };

    let executor = target.executor(&config);
    let processed = executor.process(&mut context, &config.limits).await;
    if let ExecutionTarget::Container(host) = &target {
        host.teardown().await;
    }
    let result = match processed {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Execution failed");
            eprintln!("{e}");
            return Ok(ExitCode::FAILURE);
        }
    };

    if !result.stdout.is_empty() {
        print!("{}", result.stdout);
    }
    if !result.stderr.is_empty() {
        eprint!("{}", result.stderr);
    }
    if !result.user_error.is_empty() {
        eprintln!("User error:\n{}", result.user_error);
    }
    if !result.system_error.is_empty() {
        eprintln!("System error:\n{}", result.system_error);
    }

    if !args.quiet {
        println!("Execution finished with status {}", result.status);
        if result.timed_out {
            println!("Processing was stopped by the time limit");
        }
        for line in result.statistics.summary() {
            println!("  {line}");
        }
    }

    Ok(if result.status == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
