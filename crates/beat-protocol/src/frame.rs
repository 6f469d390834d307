// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for multipart messages.
//!
//! Every message is a list of byte parts, the first one being the command.
//! On the wire a frame is laid out as:
//! - 4 bytes: body length (big-endian)
//! - 2 bytes: number of parts
//! - for each part: 4 bytes part length (big-endian) followed by the bytes

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum body size (64 MB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Maximum number of parts in a single frame
pub const MAX_PARTS: usize = 1024;

/// Frame header size (4 bytes length + 2 bytes part count)
pub const HEADER_SIZE: usize = 6;

/// Size of the length prefix in front of each part
pub const PART_HEADER_SIZE: usize = 4;

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("too many parts: {0} (max: {MAX_PARTS})")]
    TooManyParts(usize),

    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    #[error("missing part {0}")]
    MissingPart(usize),

    #[error("part is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// A multipart message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    parts: Vec<Bytes>,
}

impl Frame {
    /// Create a frame from its parts
    pub fn new<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Bytes>,
    {
        Self {
            parts: parts.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a frame holding only a command
    pub fn command_only(command: &'static [u8]) -> Self {
        Self {
            parts: vec![Bytes::from_static(command)],
        }
    }

    /// Append a part, builder style
    pub fn with_part(mut self, part: impl Into<Bytes>) -> Self {
        self.parts.push(part.into());
        self
    }

    /// Append a part
    pub fn push(&mut self, part: impl Into<Bytes>) {
        self.parts.push(part.into());
    }

    /// All parts, command included
    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    /// Consume the frame and return its parts
    pub fn into_parts(self) -> Vec<Bytes> {
        self.parts
    }

    /// Number of parts
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Whether the frame has no parts at all
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// The first part
    pub fn command(&self) -> Option<&[u8]> {
        self.parts.first().map(|p| p.as_ref())
    }

    /// Raw access to part `index`
    pub fn part(&self, index: usize) -> Result<&Bytes, FrameError> {
        self.parts.get(index).ok_or(FrameError::MissingPart(index))
    }

    /// Part `index` decoded as UTF-8
    pub fn part_str(&self, index: usize) -> Result<&str, FrameError> {
        Ok(std::str::from_utf8(self.part(index)?)?)
    }

    /// Every part from `start` on, decoded as UTF-8
    pub fn parts_str_from(&self, start: usize) -> Result<Vec<String>, FrameError> {
        self.parts
            .iter()
            .skip(start)
            .map(|p| Ok(std::str::from_utf8(p)?.to_string()))
            .collect()
    }

    fn body_len(&self) -> usize {
        self.parts.iter().map(|p| PART_HEADER_SIZE + p.len()).sum()
    }

    /// Encode the frame to bytes for wire transmission
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        if self.parts.len() > MAX_PARTS {
            return Err(FrameError::TooManyParts(self.parts.len()));
        }
        let body_len = self.body_len();
        if body_len > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(body_len));
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body_len);
        buf.put_u32(body_len as u32);
        buf.put_u16(self.parts.len() as u16);
        for part in &self.parts {
            buf.put_u32(part.len() as u32);
            buf.put(part.clone());
        }
        Ok(buf.freeze())
    }

    /// Decode a frame from bytes
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame header",
            )));
        }

        let length = bytes.get_u32() as usize;
        let count = bytes.get_u16() as usize;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }
        if count > MAX_PARTS {
            return Err(FrameError::TooManyParts(count));
        }
        if bytes.len() < length {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame body",
            )));
        }

        let body = bytes.split_to(length);
        decode_body(body, count)
    }
}

fn decode_body(mut body: Bytes, count: usize) -> Result<Frame, FrameError> {
    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        if body.len() < PART_HEADER_SIZE {
            return Err(FrameError::Malformed("truncated part header"));
        }
        let part_len = body.get_u32() as usize;
        if body.len() < part_len {
            return Err(FrameError::Malformed("truncated part"));
        }
        parts.push(body.split_to(part_len));
    }
    if !body.is_empty() {
        return Err(FrameError::Malformed("trailing bytes after last part"));
    }
    Ok(Frame { parts })
}

/// Write a frame to an async writer
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let encoded = frame.encode()?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a frame from an async reader
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let count = u16::from_be_bytes([header[4], header[5]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }
    if count > MAX_PARTS {
        return Err(FrameError::TooManyParts(count));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;

    decode_body(Bytes::from(body), count)
}

/// Framed wrapper around a byte stream
pub struct FramedStream<S> {
    stream: S,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    /// Read the next frame from the stream
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        read_frame(&mut self.stream).await
    }
}

impl<S: AsyncWrite + Unpin> FramedStream<S> {
    /// Write a frame to the stream
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        write_frame(&mut self.stream, frame).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedStream<S> {
    /// Send a frame and wait for the peer's reply
    pub async fn request(&mut self, frame: &Frame) -> Result<Frame, FrameError> {
        self.write_frame(frame).await?;
        self.read_frame().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size_constant() {
        // 4 bytes length + 2 bytes part count
        assert_eq!(HEADER_SIZE, 6);
    }

    #[test]
    fn test_encode_layout() {
        let frame = Frame::new([&b"ack"[..], &b"42"[..]]);
        let encoded = frame.encode().unwrap();

        // body: (4 + 3) + (4 + 2)
        assert_eq!(&encoded[0..4], &13u32.to_be_bytes());
        assert_eq!(&encoded[4..6], &2u16.to_be_bytes());
        assert_eq!(&encoded[6..10], &3u32.to_be_bytes());
        assert_eq!(&encoded[10..13], b"ack");
        assert_eq!(&encoded[13..17], &2u32.to_be_bytes());
        assert_eq!(&encoded[17..19], b"42");
    }

    #[test]
    fn test_empty_parts_are_preserved() {
        let frame = Frame::new([&b"don"[..], &b""[..], &b"x"[..]]);
        let decoded = Frame::decode_from_bytes(frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.len(), 3);
        assert!(decoded.part(1).unwrap().is_empty());
        assert_eq!(decoded.part_str(2).unwrap(), "x");
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(6);
        buf.put_u16(1);
        buf.put_u32(1);
        buf.put_u8(b'a');
        buf.put_u8(b'b');
        let err = Frame::decode_from_bytes(buf.freeze()).unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[test]
    fn test_truncated_part_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u16(1);
        buf.put_u32(9);
        buf.put_u8(b'a');
        let err = Frame::decode_from_bytes(buf.freeze()).unwrap_err();
        assert!(matches!(err, FrameError::Malformed("truncated part")));
    }

    #[test]
    fn test_too_many_parts_on_encode() {
        let frame = Frame::new(std::iter::repeat_n(&b"x"[..], MAX_PARTS + 1));
        assert!(matches!(frame.encode(), Err(FrameError::TooManyParts(_))));
    }

    #[test]
    fn test_missing_part() {
        let frame = Frame::command_only(b"rdy");
        assert!(matches!(frame.part(1), Err(FrameError::MissingPart(1))));
        assert_eq!(frame.command(), Some(&b"rdy"[..]));
    }

    #[test]
    fn test_invalid_utf8_part() {
        let frame = Frame::new([vec![0xff, 0xfe]]);
        assert!(matches!(frame.part_str(0), Err(FrameError::Utf8(_))));
    }

    #[tokio::test]
    async fn test_read_frame_on_closed_stream() {
        let mut empty: &[u8] = &[];
        let err = read_frame(&mut empty).await.unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }
}
