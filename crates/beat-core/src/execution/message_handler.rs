// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Endpoint serving one algorithm process.
//!
//! The handler accepts a single connection from the algorithm process. On it,
//! the executor's control requests (`stp`, `pre`, `prc`, `don`, forwarded
//! `lrq`) travel one at a time towards the algorithm, while the algorithm's
//! data requests (`ifo`, `nxt`, `wrt`, `sta`, `lrq`) are served from the
//! cached data endpoints.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use beat_protocol::{AlgorithmCommand, Frame, FrameError, read_frame, write_frame};
use socket2::SockRef;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{ExecutionError, Failure, FailureKind};
use crate::data::{IoEndpoints, Record};
use crate::stats::DataStatistics;

type Reply = oneshot::Sender<Result<Frame, FrameError>>;

struct ControlRequest {
    frame: Frame,
    reply: Reply,
}

/// Sends control requests to the algorithm process behind a handler.
#[derive(Debug, Clone)]
pub struct HandlerLink {
    control: mpsc::Sender<ControlRequest>,
}

impl std::fmt::Debug for ControlRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlRequest")
            .field("command", &self.frame.command().map(String::from_utf8_lossy))
            .finish()
    }
}

impl HandlerLink {
    /// Send `frame` and wait for the algorithm's `ack` or `err` reply.
    ///
    /// Requests are queued until the algorithm process has connected.
    pub async fn request(&self, frame: Frame) -> Result<Frame, ExecutionError> {
        let (reply, response) = oneshot::channel();
        self.control
            .send(ControlRequest { frame, reply })
            .await
            .map_err(|_| ExecutionError::HandlerClosed)?;
        Ok(response.await.map_err(|_| ExecutionError::HandlerClosed)??)
    }
}

/// What a handler gathered by the time it was stopped.
#[derive(Debug, Default)]
pub struct HandlerReport {
    /// The data endpoints, handed back
    pub io: IoEndpoints,
    /// Statistics reported by the algorithm (`sta`)
    pub statistics: DataStatistics,
    /// Failure of the user code reported outside of a control request
    pub user_error: Option<String>,
    /// Protocol or runtime failure
    pub system_error: Option<String>,
}

/// A running handler task.
#[derive(Debug)]
pub struct MessageHandler {
    address: SocketAddr,
    control: mpsc::Sender<ControlRequest>,
    stop: Arc<Notify>,
    task: JoinHandle<HandlerReport>,
}

async fn bind_listener(ip: IpAddr, port_range: Option<(u16, u16)>) -> std::io::Result<TcpListener> {
    let Some((min, max)) = port_range else {
        return TcpListener::bind((ip, 0)).await;
    };
    for port in min..=max {
        match TcpListener::bind((ip, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => debug!(port, error = %e, "Port unavailable"),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        format!("no free port in range {min}:{max}"),
    ))
}

impl MessageHandler {
    /// Bind on `ip` (first free port of `port_range`, any port otherwise) and
    /// start serving `io`. `loop_link` receives the `lrq` requests of the
    /// algorithm.
    pub async fn bind(
        ip: IpAddr,
        port_range: Option<(u16, u16)>,
        io: IoEndpoints,
        loop_link: Option<HandlerLink>,
    ) -> Result<Self, ExecutionError> {
        let listener = bind_listener(ip, port_range).await?;
        let address = listener.local_addr()?;
        let (control, control_rx) = mpsc::channel(8);
        let stop = Arc::new(Notify::new());

        let state = HandlerState {
            io,
            loop_link,
            statistics: DataStatistics::default(),
            user_error: None,
            system_error: None,
        };
        let task = tokio::spawn(serve(listener, state, control_rx, stop.clone()));
        debug!(address = %address, "Message handler listening");

        Ok(Self {
            address,
            control,
            stop,
            task,
        })
    }

    /// Bound address.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Link for sending control requests.
    pub fn link(&self) -> HandlerLink {
        HandlerLink {
            control: self.control.clone(),
        }
    }

    /// Stop serving, dropping the connection, and hand back the endpoints.
    pub async fn stop(self) -> HandlerReport {
        self.stop.notify_one();
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Message handler task failed");
                HandlerReport {
                    system_error: Some(format!("message handler failed: {e}")),
                    ..HandlerReport::default()
                }
            }
        }
    }
}

struct HandlerState {
    io: IoEndpoints,
    loop_link: Option<HandlerLink>,
    statistics: DataStatistics,
    user_error: Option<String>,
    system_error: Option<String>,
}

impl HandlerState {
    fn into_report(self) -> HandlerReport {
        HandlerReport {
            io: self.io,
            statistics: self.statistics,
            user_error: self.user_error,
            system_error: self.system_error,
        }
    }

    fn record_failure(&mut self, failure: Failure) {
        warn!(failure = %failure, "Algorithm reported a failure");
        let slot = match failure.kind {
            FailureKind::User => &mut self.user_error,
            FailureKind::System => &mut self.system_error,
        };
        slot.get_or_insert_with(|| failure.to_string());
    }

    fn failure_reply(message: impl Into<String>) -> Frame {
        Frame::command_only(AlgorithmCommand::Error.as_bytes())
            .with_part(Failure::system("RuntimeError", message).to_json())
    }

    /// Serve one data request; returns the reply to send.
    async fn serve_request(&mut self, command: AlgorithmCommand, frame: &Frame) -> Frame {
        let ack = || Frame::command_only(AlgorithmCommand::Ack.as_bytes());

        match command {
            AlgorithmCommand::Infos => ack().with_part(self.io.describe().to_string()),

            AlgorithmCommand::Next => {
                let Ok(name) = frame.part_str(1) else {
                    return Self::failure_reply("nxt without an input name");
                };
                let Some(source) = self.io.inputs.get_mut(name) else {
                    return Self::failure_reply(format!("unknown input `{name}'"));
                };
                match source.next_record() {
                    Ok(Some(record)) => match serde_json::to_string(&record) {
                        Ok(json) => ack().with_part(json),
                        Err(e) => Self::failure_reply(e.to_string()),
                    },
                    Ok(None) => Frame::command_only(AlgorithmCommand::End.as_bytes()),
                    Err(e) => {
                        error!(input = %name, error = %e, "Failed to read input");
                        self.system_error
                            .get_or_insert_with(|| format!("cannot read input `{name}': {e}"));
                        Self::failure_reply(e.to_string())
                    }
                }
            }

            AlgorithmCommand::Write => {
                let (Ok(name), Ok(payload)) = (frame.part_str(1), frame.part(2)) else {
                    return Self::failure_reply("wrt needs an output name and a record");
                };
                let record: Record = match serde_json::from_slice(payload) {
                    Ok(record) => record,
                    Err(e) => return Self::failure_reply(format!("invalid record: {e}")),
                };
                let Some(sink) = self.io.outputs.get_mut(name) else {
                    return Self::failure_reply(format!("unknown output `{name}'"));
                };
                match sink.write(&record) {
                    Ok(()) => ack(),
                    Err(e) => {
                        error!(output = %name, error = %e, "Failed to write output");
                        self.system_error
                            .get_or_insert_with(|| format!("cannot write output `{name}': {e}"));
                        Self::failure_reply(e.to_string())
                    }
                }
            }

            AlgorithmCommand::Statistics => {
                match frame
                    .part(1)
                    .ok()
                    .map(|payload| serde_json::from_slice::<DataStatistics>(payload))
                {
                    Some(Ok(statistics)) => {
                        self.statistics += statistics;
                        ack()
                    }
                    _ => Self::failure_reply("invalid statistics"),
                }
            }

            AlgorithmCommand::LoopRequest => {
                let Some(link) = &self.loop_link else {
                    return Self::failure_reply("no loop algorithm to forward the request to");
                };
                let payload = frame.part(1).cloned().unwrap_or_default();
                let request =
                    Frame::command_only(AlgorithmCommand::LoopRequest.as_bytes()).with_part(payload);
                match link.request(request).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        error!(error = %e, "Loop request failed");
                        Self::failure_reply(format!("loop request failed: {e}"))
                    }
                }
            }

            other => {
                let message = format!("unexpected command `{other}' from algorithm");
                error!(command = %other, "Unexpected command from algorithm");
                self.system_error.get_or_insert_with(|| message.clone());
                Self::failure_reply(message)
            }
        }
    }

    async fn handle(
        &mut self,
        frame: Frame,
        writer: &mut OwnedWriteHalf,
        pending: &mut Option<Reply>,
    ) -> Result<(), FrameError> {
        let command = match frame.command().map(AlgorithmCommand::try_from) {
            Some(Ok(command)) => command,
            _ => {
                let name = frame
                    .command()
                    .map(|c| String::from_utf8_lossy(c).into_owned())
                    .unwrap_or_default();
                error!(command = %name, "Unknown command from algorithm");
                self.system_error
                    .get_or_insert_with(|| format!("unknown command `{name}' from algorithm"));
                return write_frame(writer, &Self::failure_reply("unknown command")).await;
            }
        };

        match command {
            AlgorithmCommand::Ack | AlgorithmCommand::Error => {
                if let Some(reply) = pending.take() {
                    let _ = reply.send(Ok(frame));
                } else if command == AlgorithmCommand::Error {
                    self.record_failure(Failure::parse(
                        frame.part(1).map(|p| &p[..]).unwrap_or_default(),
                    ));
                } else {
                    warn!("Unsolicited acknowledgement from algorithm, ignoring");
                }
                Ok(())
            }
            _ => {
                let reply = self.serve_request(command, &frame).await;
                write_frame(writer, &reply).await
            }
        }
    }
}

async fn serve(
    listener: TcpListener,
    mut state: HandlerState,
    mut control: mpsc::Receiver<ControlRequest>,
    stop: Arc<Notify>,
) -> HandlerReport {
    let stream: TcpStream = tokio::select! {
        biased;

        _ = stop.notified() => return state.into_report(),

        accepted = listener.accept() => match accepted {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "Algorithm process connected");
                stream
            }
            Err(e) => {
                error!(error = %e, "Failed to accept the algorithm connection");
                state.system_error = Some(format!("cannot accept connection: {e}"));
                return state.into_report();
            }
        },
    };
    drop(listener);

    // Pending bytes are dropped on close instead of holding up teardown.
    if let Err(e) = SockRef::from(&stream).set_linger(Some(Duration::ZERO)) {
        debug!(error = %e, "Failed to set zero linger");
    }

    let (mut reader, mut writer) = stream.into_split();
    let (incoming_tx, mut incoming) = mpsc::channel::<Result<Frame, FrameError>>(16);
    let reader_task = tokio::spawn(async move {
        loop {
            let frame = read_frame(&mut reader).await;
            let closed = frame.is_err();
            if incoming_tx.send(frame).await.is_err() || closed {
                break;
            }
        }
    });

    let mut pending: Option<Reply> = None;
    let mut control_open = true;
    let mut stopped = false;

    loop {
        tokio::select! {
            biased;

            _ = stop.notified() => {
                stopped = true;
                break;
            }

            frame = incoming.recv() => match frame {
                Some(Ok(frame)) => {
                    if let Err(e) = state.handle(frame, &mut writer, &mut pending).await {
                        warn!(error = %e, "Failed to reply to the algorithm");
                        break;
                    }
                }
                Some(Err(FrameError::ConnectionClosed)) | None => {
                    debug!("Algorithm process disconnected");
                    break;
                }
                Some(Err(e)) => {
                    error!(error = %e, "Invalid frame from algorithm");
                    state.system_error.get_or_insert_with(|| e.to_string());
                    break;
                }
            },

            request = control.recv(), if control_open && pending.is_none() => match request {
                Some(request) => match write_frame(&mut writer, &request.frame).await {
                    Ok(()) => pending = Some(request.reply),
                    Err(e) => {
                        let _ = request.reply.send(Err(e));
                    }
                },
                None => control_open = false,
            },
        }
    }

    reader_task.abort();
    if let Some(reply) = pending.take() {
        let _ = reply.send(Err(FrameError::ConnectionClosed));
    }
    drop(writer);

    // Connection gone: later control requests fail fast until stopped.
    while !stopped && control_open {
        tokio::select! {
            biased;

            _ = stop.notified() => stopped = true,

            request = control.recv() => match request {
                Some(request) => {
                    let _ = request.reply.send(Err(FrameError::ConnectionClosed));
                }
                None => control_open = false,
            },
        }
    }
    if !stopped {
        stop.notified().await;
    }

    state.into_report()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CachedDataSink, CachedDataSource};
    use beat_protocol::FramedStream;
    use serde_json::{Value, json};
    use std::net::Ipv4Addr;

    fn endpoints(cache: &std::path::Path) -> IoEndpoints {
        let mut sink = CachedDataSink::create(cache, "in").unwrap();
        for i in 0..2u64 {
            sink.write(&Record {
                start: i,
                end: i,
                value: json!({"value": i}),
            })
            .unwrap();
        }
        sink.close().unwrap();

        let mut io = IoEndpoints::default();
        io.inputs
            .insert("in".into(), CachedDataSource::open(cache, "in").unwrap());
        io.outputs
            .insert("out".into(), CachedDataSink::create(cache, "out").unwrap());
        io.formats.insert("in".into(), "user/integer/1".into());
        io.formats.insert("out".into(), "user/integer/1".into());
        io
    }

    fn request(parts: &[&str]) -> Frame {
        Frame::new(parts.iter().map(|p| p.as_bytes().to_vec()))
    }

    #[tokio::test]
    async fn test_serves_data_requests() {
        let cache = tempfile::tempdir().unwrap();
        let handler = MessageHandler::bind(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            None,
            endpoints(cache.path()),
            None,
        )
        .await
        .unwrap();

        let stream = TcpStream::connect(handler.address()).await.unwrap();
        let mut algorithm = FramedStream::new(stream);

        let infos = algorithm.request(&request(&["ifo"])).await.unwrap();
        let infos: Value = serde_json::from_slice(infos.part(1).unwrap()).unwrap();
        assert_eq!(infos["inputs"]["in"]["dataformat"], "user/integer/1");

        for expected in 0..2 {
            let reply = algorithm.request(&request(&["nxt", "in"])).await.unwrap();
            assert_eq!(reply.command(), Some(&b"ack"[..]));
            let record: Record = serde_json::from_slice(reply.part(1).unwrap()).unwrap();
            assert_eq!(record.value["value"], expected);
        }
        let end = algorithm.request(&request(&["nxt", "in"])).await.unwrap();
        assert_eq!(end.command(), Some(&b"end"[..]));

        let record = r#"{"start":0,"end":1,"value":{"value":42}}"#;
        let reply = algorithm.request(&request(&["wrt", "out", record])).await.unwrap();
        assert_eq!(reply.command(), Some(&b"ack"[..]));

        let stats = r#"{"network":{"wait_time":1.5}}"#;
        let reply = algorithm.request(&request(&["sta", stats])).await.unwrap();
        assert_eq!(reply.command(), Some(&b"ack"[..]));

        let reply = algorithm.request(&request(&["nxt", "missing"])).await.unwrap();
        assert_eq!(reply.command(), Some(&b"err"[..]));

        drop(algorithm);
        let mut report = handler.stop().await;
        assert_eq!(report.statistics.network.wait_time, 1.5);
        assert!(report.system_error.is_none());
        report.io.close(true).unwrap();
        assert!(cache.path().join("out.data.checksum").exists());
    }

    #[tokio::test]
    async fn test_control_request_round_trip() {
        let handler = MessageHandler::bind(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            None,
            IoEndpoints::default(),
            None,
        )
        .await
        .unwrap();
        let link = handler.link();
        let address = handler.address();

        let algorithm = tokio::spawn(async move {
            let stream = TcpStream::connect(address).await.unwrap();
            let mut framed = FramedStream::new(stream);
            let setup = framed.read_frame().await.unwrap();
            assert_eq!(setup.part_str(0).unwrap(), "stp");
            framed
                .write_frame(&request(&["ack"]))
                .await
                .unwrap();
            let process = framed.read_frame().await.unwrap();
            assert_eq!(process.part_str(0).unwrap(), "prc");
            let failure = Failure::user("ValueError", "bad");
            framed
                .write_frame(&request(&["err", &failure.to_json()]))
                .await
                .unwrap();
        });

        let reply = link.request(request(&["stp", "{}"])).await.unwrap();
        assert_eq!(reply.command(), Some(&b"ack"[..]));
        let reply = link.request(request(&["prc"])).await.unwrap();
        assert_eq!(reply.command(), Some(&b"err"[..]));
        algorithm.await.unwrap();

        // The algorithm is gone; further requests fail instead of hanging.
        let err = link.request(request(&["don"])).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Protocol(_)));

        handler.stop().await;
    }

    #[tokio::test]
    async fn test_port_range() {
        let occupied = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let taken = occupied.local_addr().unwrap().port();
        let listener = bind_listener(IpAddr::V4(Ipv4Addr::LOCALHOST), Some((taken, taken))).await;
        assert!(listener.is_err());
        drop(occupied);
    }
}
