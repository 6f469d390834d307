// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Frame transport tests for beat-protocol.

use bytes::{BufMut, Bytes, BytesMut};
use beat_protocol::frame::{Frame, FrameError, FramedStream, MAX_FRAME_SIZE, read_frame, write_frame};
use beat_protocol::{AlgorithmCommand, WorkerCommand};
use tokio::net::{TcpListener, TcpStream};

#[test]
fn test_oversized_header_rejected() {
    let mut buf = BytesMut::new();
    buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
    buf.put_u16(1);
    let err = Frame::decode_from_bytes(buf.freeze()).unwrap_err();
    assert!(matches!(err, FrameError::FrameTooLarge(_)));
}

#[test]
fn test_incomplete_header() {
    let err = Frame::decode_from_bytes(Bytes::from_static(&[0, 0, 0])).unwrap_err();
    assert!(matches!(err, FrameError::Io(_)));
}

#[test]
fn test_worker_frame_parts() {
    let frame = Frame::command_only(WorkerCommand::Execute.as_bytes())
        .with_part("job-1")
        .with_part(r#"{"algorithm":"user/echo/1"}"#);

    let decoded = Frame::decode_from_bytes(frame.encode().unwrap()).unwrap();
    let cmd = WorkerCommand::try_from(decoded.command().unwrap()).unwrap();
    assert_eq!(cmd, WorkerCommand::Execute);
    assert_eq!(decoded.part_str(1).unwrap(), "job-1");
    assert_eq!(decoded.parts_str_from(1).unwrap().len(), 2);
}

#[tokio::test]
async fn test_sequential_frames_over_duplex() {
    let (mut a, mut b) = tokio::io::duplex(1024);

    write_frame(&mut a, &Frame::command_only(b"ifo")).await.unwrap();
    write_frame(&mut a, &Frame::command_only(b"nxt").with_part("in"))
        .await
        .unwrap();
    drop(a);

    let first = read_frame(&mut b).await.unwrap();
    assert_eq!(first.command(), Some(AlgorithmCommand::Infos.as_bytes()));
    let second = read_frame(&mut b).await.unwrap();
    assert_eq!(second.part_str(1).unwrap(), "in");

    let closed = read_frame(&mut b).await.unwrap_err();
    assert!(matches!(closed, FrameError::ConnectionClosed));
}

#[tokio::test]
async fn test_request_reply_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = FramedStream::new(stream);
        let request = framed.read_frame().await.unwrap();
        let reply = Frame::command_only(AlgorithmCommand::Ack.as_bytes())
            .with_part(request.part(1).unwrap().clone());
        framed.write_frame(&reply).await.unwrap();
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut client = FramedStream::new(stream);
    let reply = client
        .request(&Frame::command_only(AlgorithmCommand::Setup.as_bytes()).with_part("{}"))
        .await
        .unwrap();

    assert_eq!(reply.command(), Some(&b"ack"[..]));
    assert_eq!(reply.part_str(1).unwrap(), "{}");
    server.await.unwrap();
}
