// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command vocabularies carried in the first part of every frame.

use std::fmt;

use crate::frame::FrameError;

/// Commands exchanged between a worker and the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerCommand {
    /// Worker -> scheduler: worker is available
    Ready,
    /// Worker -> scheduler: worker is going away
    Exit,
    /// Worker -> scheduler: job finished (result attached)
    Done,
    /// Worker -> scheduler: job request was invalid
    JobError,
    /// Worker -> scheduler: job crashed
    Error,
    /// Worker -> scheduler: job was cancelled
    Cancelled,
    /// Scheduler -> worker: run a job
    Execute,
    /// Scheduler -> worker: cancel a job
    Cancel,
    /// Scheduler -> worker: acknowledgement
    Ack,
    /// Scheduler -> worker: scheduler is shutting down
    SchedulerShutdown,
}

impl WorkerCommand {
    /// Byte value on the wire
    pub const fn as_bytes(self) -> &'static [u8] {
        match self {
            WorkerCommand::Ready => b"rdy",
            WorkerCommand::Exit => b"ext",
            WorkerCommand::Done => b"don",
            WorkerCommand::JobError => b"erj",
            WorkerCommand::Error => b"err",
            WorkerCommand::Cancelled => b"cld",
            WorkerCommand::Execute => b"exe",
            WorkerCommand::Cancel => b"cnl",
            WorkerCommand::Ack => b"ack",
            WorkerCommand::SchedulerShutdown => b"shd",
        }
    }
}

impl TryFrom<&[u8]> for WorkerCommand {
    type Error = FrameError;

    fn try_from(value: &[u8]) -> Result<Self, FrameError> {
        Ok(match value {
            b"rdy" => WorkerCommand::Ready,
            b"ext" => WorkerCommand::Exit,
            b"don" => WorkerCommand::Done,
            b"erj" => WorkerCommand::JobError,
            b"err" => WorkerCommand::Error,
            b"cld" => WorkerCommand::Cancelled,
            b"exe" => WorkerCommand::Execute,
            b"cnl" => WorkerCommand::Cancel,
            b"ack" => WorkerCommand::Ack,
            b"shd" => WorkerCommand::SchedulerShutdown,
            _ => return Err(FrameError::Malformed("unknown worker command")),
        })
    }
}

impl fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(String::from_utf8_lossy(self.as_bytes()).as_ref())
    }
}

/// Commands exchanged between the executor side (message handler) and an
/// algorithm process.
///
/// The same vocabulary flows both ways on one connection: the executor sends
/// control commands (`Setup`, `Prepare`, `Process`, `Done`, forwarded
/// `LoopRequest`) and receives `Ack`/`Error`; the algorithm sends data requests
/// (`Infos`, `Next`, `Write`, `LoopRequest`, `Statistics`) and receives
/// `Ack`/`End`/`Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmCommand {
    /// `stp <parameters-json>`
    Setup,
    /// `pre`
    Prepare,
    /// `prc`
    Process,
    /// `don`
    Done,
    /// `lrq <json>`
    LoopRequest,
    /// `ack [payload]`
    Ack,
    /// `err <failure-json>`
    Error,
    /// `end`: input exhausted
    End,
    /// `ifo`: describe inputs and outputs
    Infos,
    /// `nxt <input>`
    Next,
    /// `wrt <output> <record-json>`
    Write,
    /// `sta <json>`
    Statistics,
}

impl AlgorithmCommand {
    /// Byte value on the wire
    pub const fn as_bytes(self) -> &'static [u8] {
        match self {
            AlgorithmCommand::Setup => b"stp",
            AlgorithmCommand::Prepare => b"pre",
            AlgorithmCommand::Process => b"prc",
            AlgorithmCommand::Done => b"don",
            AlgorithmCommand::LoopRequest => b"lrq",
            AlgorithmCommand::Ack => b"ack",
            AlgorithmCommand::Error => b"err",
            AlgorithmCommand::End => b"end",
            AlgorithmCommand::Infos => b"ifo",
            AlgorithmCommand::Next => b"nxt",
            AlgorithmCommand::Write => b"wrt",
            AlgorithmCommand::Statistics => b"sta",
        }
    }

    /// Whether the command is a request issued by the algorithm process
    pub const fn is_data_request(self) -> bool {
        matches!(
            self,
            AlgorithmCommand::Infos
                | AlgorithmCommand::Next
                | AlgorithmCommand::Write
                | AlgorithmCommand::LoopRequest
                | AlgorithmCommand::Statistics
        )
    }
}

impl TryFrom<&[u8]> for AlgorithmCommand {
    type Error = FrameError;

    fn try_from(value: &[u8]) -> Result<Self, FrameError> {
        Ok(match value {
            b"stp" => AlgorithmCommand::Setup,
            b"pre" => AlgorithmCommand::Prepare,
            b"prc" => AlgorithmCommand::Process,
            b"don" => AlgorithmCommand::Done,
            b"lrq" => AlgorithmCommand::LoopRequest,
            b"ack" => AlgorithmCommand::Ack,
            b"err" => AlgorithmCommand::Error,
            b"end" => AlgorithmCommand::End,
            b"ifo" => AlgorithmCommand::Infos,
            b"nxt" => AlgorithmCommand::Next,
            b"wrt" => AlgorithmCommand::Write,
            b"sta" => AlgorithmCommand::Statistics,
            _ => return Err(FrameError::Malformed("unknown algorithm command")),
        })
    }
}

impl fmt::Display for AlgorithmCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(String::from_utf8_lossy(self.as_bytes()).as_ref())
    }
}
