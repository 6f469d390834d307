// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker process driver.
//!
//! A worker announces itself to the scheduler, then runs every job it is
//! given in a dedicated OS process so that a crashing or hanging algorithm
//! cannot take the worker down and a job can be cancelled by terminating
//! its process.
//!
//! ```text
//!   scheduler ◄──frames──► Worker ──stdin json──► job process (run_job)
//!                            ▲                          │
//!                            └──── JobOutcome json ─────┘
//! ```

mod job;
mod link;

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use beat_protocol::{Frame, FrameError, WorkerCommand};
use tracing::{debug, error, info, warn};

pub use job::{JobOutcome, JobRequest, TargetSpec, run_job, run_job_until};
pub use link::{SchedulerLink, socket_address};

use job::JobProcess;

/// Receive timeout while jobs are running.
const BUSY_POLL: Duration = Duration::from_millis(100);

/// Receive timeout while idle.
const IDLE_POLL: Duration = Duration::from_millis(1000);

/// Delay between reconnection attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// How long a cancelled job process gets to clean up after SIGTERM.
const CANCEL_GRACE: Duration = Duration::from_secs(15);

/// Flag of the hidden command line switch running one job.
pub const JOB_PROCESS_FLAG: &str = "--job-process";

/// Worker settings.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Name announced to the scheduler
    pub name: String,
    /// `tcp://host:port` of the scheduler
    pub scheduler_address: String,
    /// Declaration prefix
    pub prefix: PathBuf,
    /// Data cache
    pub cache: PathBuf,
    /// Where jobs run
    pub target: TargetSpec,
    /// Program and arguments of the job processes
    pub job_command: Vec<String>,
}

impl WorkerOptions {
    /// Job command re-running the current executable with [`JOB_PROCESS_FLAG`].
    pub fn current_exe_job_command() -> std::io::Result<Vec<String>> {
        let exe = std::env::current_exe()?;
        Ok(vec![
            exe.to_string_lossy().into_owned(),
            JOB_PROCESS_FLAG.to_string(),
        ])
    }
}

enum Step {
    Continue,
    Reconnect,
}

/// Connects to a scheduler and runs the jobs it sends.
pub struct Worker {
    options: WorkerOptions,
    stop: Arc<AtomicBool>,
    jobs: BTreeMap<String, JobProcess>,
    /// Outcome frames not yet delivered, kept across reconnections
    pending: VecDeque<Frame>,
}

impl Worker {
    /// Worker stopping once `stop` is set.
    pub fn new(options: WorkerOptions, stop: Arc<AtomicBool>) -> Self {
        Self {
            options,
            stop,
            jobs: BTreeMap::new(),
            pending: VecDeque::new(),
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Connect, retrying every second until connected or stopped.
    async fn connect(&self) -> Option<SchedulerLink> {
        loop {
            if self.stopped() {
                return None;
            }
            match SchedulerLink::connect(&self.options.scheduler_address).await {
                Ok(mut link) => {
                    let stop = self.stop.clone();
                    match link
                        .handshake(&self.options.name, || stop.load(Ordering::SeqCst))
                        .await
                    {
                        Ok(true) => {
                            info!(
                                worker = %self.options.name,
                                scheduler = %self.options.scheduler_address,
                                "Registered with the scheduler"
                            );
                            return Some(link);
                        }
                        Ok(false) => return None,
                        Err(e) => warn!(error = %e, "Handshake with the scheduler failed"),
                    }
                }
                Err(e) => debug!(
                    scheduler = %self.options.scheduler_address,
                    error = %e,
                    "Cannot connect to the scheduler"
                ),
            }
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    }

    /// Run until the stop flag is set.
    pub async fn run(mut self) -> crate::Result<()> {
        let mut link = self.connect().await;
        if link.is_none() {
            info!("Stopped before the scheduler acknowledged");
            return Ok(());
        }

        while !self.stopped() {
            let Some(current) = link.as_mut() else {
                break;
            };
            if let Step::Reconnect = self.step(current).await {
                drop(link.take());
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                link = self.connect().await;
            }
        }

        self.shutdown(link.as_mut()).await;
        info!(worker = %self.options.name, "Worker stopped");
        Ok(())
    }

    /// Report finished jobs, then wait for and handle one scheduler message.
    async fn step(&mut self, link: &mut SchedulerLink) -> Step {
        if let Err(e) = self.report_finished(link).await {
            warn!(error = %e, "Lost the scheduler while reporting results");
            return Step::Reconnect;
        }

        let timeout = if self.jobs.is_empty() {
            IDLE_POLL
        } else {
            BUSY_POLL
        };
        let frame = match link.receive(timeout).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Step::Continue,
            Err(e) => {
                warn!(error = %e, "Lost the scheduler");
                return Step::Reconnect;
            }
        };

        match frame.command().map(WorkerCommand::try_from) {
            Some(Ok(WorkerCommand::Execute)) => {
                if let Err(e) = self.execute(link, &frame).await {
                    warn!(error = %e, "Failed to answer an execute request");
                }
            }
            Some(Ok(WorkerCommand::Cancel)) => {
                if let Err(e) = self.cancel(link, &frame).await {
                    warn!(error = %e, "Failed to answer a cancel request");
                }
            }
            Some(Ok(WorkerCommand::SchedulerShutdown)) => {
                info!("The scheduler is shutting down, reconnecting");
                return Step::Reconnect;
            }
            other => warn!(
                command = ?other,
                parts = frame.len(),
                "Ignoring unexpected message from the scheduler"
            ),
        }
        Step::Continue
    }

    /// Send the outcome of every job whose process exited.
    async fn report_finished(&mut self, link: &mut SchedulerLink) -> Result<(), FrameError> {
        self.collect_finished().await;
        self.flush_pending(link).await
    }

    /// Move the outcomes of exited jobs to the pending queue.
    async fn collect_finished(&mut self) {
        let mut finished = Vec::new();
        for (id, job) in self.jobs.iter_mut() {
            if let Some(outcome) = job.try_outcome().await {
                finished.push((id.clone(), outcome));
            }
        }

        for (id, outcome) in finished {
            self.jobs.remove(&id);
            let frame = outcome_frame(&id, &outcome).unwrap_or_else(|e| {
                error!(job_id = %id, error = %e, "Cannot encode the job outcome");
                Frame::command_only(WorkerCommand::Error.as_bytes())
                    .with_part(id.clone())
                    .with_part(format!("cannot encode the job outcome: {e}"))
            });
            self.pending.push_back(frame);
        }
    }

    /// Send the pending outcomes in order, keeping the ones not sent.
    async fn flush_pending(&mut self, link: &mut SchedulerLink) -> Result<(), FrameError> {
        while let Some(frame) = self.pending.front() {
            link.send(frame).await?;
            self.pending.pop_front();
        }
        Ok(())
    }

    async fn execute(&mut self, link: &mut SchedulerLink, frame: &Frame) -> Result<(), FrameError> {
        let job_id = frame.part_str(1)?.to_string();
        let request = serde_json::from_slice(frame.part(2)?)
            .map(|block| JobRequest {
                job_id: job_id.clone(),
                block,
                prefix: self.options.prefix.clone(),
                cache: self.options.cache.clone(),
                target: self.options.target.clone(),
            });
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                let reply = Frame::command_only(WorkerCommand::JobError.as_bytes())
                    .with_part(job_id)
                    .with_part(format!("invalid execution block: {e}"));
                return link.send(&reply).await;
            }
        };

        if self.jobs.contains_key(&job_id) {
            warn!(job_id = %job_id, "Job is already running, ignoring");
            return Ok(());
        }
        match JobProcess::spawn(&self.options.job_command, &request) {
            Ok(job) => {
                info!(job_id = %job.id(), "Job started");
                self.jobs.insert(job_id, job);
                Ok(())
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Cannot start the job process");
                let reply = Frame::command_only(WorkerCommand::Error.as_bytes())
                    .with_part(job_id)
                    .with_part(format!("cannot start the job process: {e}"));
                link.send(&reply).await
            }
        }
    }

    async fn cancel(&mut self, link: &mut SchedulerLink, frame: &Frame) -> Result<(), FrameError> {
        let job_id = frame.part_str(1)?.to_string();
        match self.jobs.remove(&job_id) {
            Some(mut job) => {
                job.terminate(CANCEL_GRACE).await;
                info!(job_id = %job_id, "Job cancelled");
            }
            None => debug!(job_id = %job_id, "Cancelling a job that is not running"),
        }
        link.send(&Frame::command_only(WorkerCommand::Cancelled.as_bytes()).with_part(job_id))
            .await
    }

    /// Kill the running jobs, saying goodbye to the scheduler if connected.
    async fn shutdown(&mut self, link: Option<&mut SchedulerLink>) {
        if let Some(link) = link {
            if let Err(e) = self.report_finished(link).await {
                warn!(error = %e, undelivered = self.pending.len(), "Cannot report the last results");
            }
            if let Err(e) = link
                .send(&Frame::command_only(WorkerCommand::Exit.as_bytes()))
                .await
            {
                debug!(error = %e, "Cannot notify the scheduler");
            }
            link.close().await;
        }
        let mut jobs = std::mem::take(&mut self.jobs);
        for (id, job) in &jobs {
            warn!(job_id = %id, "Stopping the job at shutdown");
            job.request_stop();
        }
        for job in jobs.values_mut() {
            job.reap(CANCEL_GRACE).await;
        }
    }
}

/// Frame reporting `outcome` of job `id`.
fn outcome_frame(id: &str, outcome: &JobOutcome) -> Result<Frame, FrameError> {
    let frame = match outcome {
        JobOutcome::Completed { result } => {
            let json = serde_json::to_string(result)
                .map_err(|_| FrameError::Malformed("unserializable result"))?;
            Frame::command_only(WorkerCommand::Done.as_bytes())
                .with_part(id.to_string())
                .with_part(json)
        }
        JobOutcome::ValidationFailed { error, details } => {
            let mut frame = Frame::command_only(WorkerCommand::JobError.as_bytes())
                .with_part(id.to_string())
                .with_part(error.clone());
            for detail in details {
                frame.push(detail.clone());
            }
            frame
        }
        JobOutcome::Crashed { system_error } => Frame::command_only(WorkerCommand::Error.as_bytes())
            .with_part(id.to_string())
            .with_part(system_error.clone()),
    };
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionResult;
    use beat_protocol::read_frame;
    use tokio::net::TcpListener;

    fn worker() -> Worker {
        let options = WorkerOptions {
            name: "test".to_string(),
            scheduler_address: "127.0.0.1:1".to_string(),
            prefix: PathBuf::from("/prefix"),
            cache: PathBuf::from("/cache"),
            target: TargetSpec::Local,
            job_command: Vec::new(),
        };
        Worker::new(options, Arc::new(AtomicBool::new(false)))
    }

    fn finished_job(id: &str) -> JobProcess {
        let script = r#"cat > /dev/null; echo '{"outcome":"crashed","system_error":"boom"}'"#;
        let command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        let request = JobRequest {
            job_id: id.to_string(),
            block: serde_json::json!({}),
            prefix: PathBuf::from("/prefix"),
            cache: PathBuf::from("/cache"),
            target: TargetSpec::Local,
        };
        JobProcess::spawn(&command, &request).unwrap()
    }

    async fn connected() -> (SchedulerLink, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (link, accepted) = tokio::join!(SchedulerLink::connect(&address), listener.accept());
        (link.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_outcomes_survive_a_lost_connection() {
        let mut worker = worker();
        worker.jobs.insert("1".to_string(), finished_job("1"));
        worker.jobs.insert("2".to_string(), finished_job("2"));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while worker.pending.len() < 2 {
            assert!(tokio::time::Instant::now() < deadline, "jobs did not finish");
            worker.collect_finished().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(worker.jobs.is_empty());

        let (mut lost, _peer) = connected().await;
        lost.close().await;
        assert!(worker.report_finished(&mut lost).await.is_err());
        assert_eq!(worker.pending.len(), 2);

        let (mut link, mut peer) = connected().await;
        worker.report_finished(&mut link).await.unwrap();
        assert!(worker.pending.is_empty());
        for id in ["1", "2"] {
            let frame = read_frame(&mut peer).await.unwrap();
            assert_eq!(frame.command(), Some(&b"err"[..]));
            assert_eq!(frame.part_str(1).unwrap(), id);
            assert_eq!(frame.part_str(2).unwrap(), "boom");
        }
    }

    #[test]
    fn test_outcome_frames() {
        let done = outcome_frame(
            "1",
            &JobOutcome::Completed {
                result: ExecutionResult::default(),
            },
        )
        .unwrap();
        assert_eq!(done.command(), Some(&b"don"[..]));
        assert_eq!(done.part_str(1).unwrap(), "1");
        let result: ExecutionResult = serde_json::from_slice(done.part(2).unwrap()).unwrap();
        assert_eq!(result.status, 0);

        let invalid = outcome_frame(
            "2",
            &JobOutcome::ValidationFailed {
                error: "Failed to load execution information".into(),
                details: vec!["a".into(), "b".into()],
            },
        )
        .unwrap();
        assert_eq!(invalid.command(), Some(&b"erj"[..]));
        assert_eq!(invalid.parts_str_from(2).unwrap().len(), 3);

        let crashed = outcome_frame(
            "3",
            &JobOutcome::Crashed {
                system_error: "boom".into(),
            },
        )
        .unwrap();
        assert_eq!(crashed.command(), Some(&b"err"[..]));
        assert_eq!(crashed.part_str(2).unwrap(), "boom");
    }
}
