//! The duplex stream a session runs over.
//!
//! A transport yields an inbound [`FrameReader`] and an outbound [`FrameWriter`] of opaque frames.
//! [`StreamTransport`] carries frames back to back on any tokio byte stream, such as a TCP
//! connection, a Unix socket or an in-memory duplex pipe.
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::trace;

use crate::{
    error::{ProtocolError, Result, RpcError},
    message::FrameScanner,
};

/// Default upper bound on a single inbound frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// The inbound half of a transport.
#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Reads the next frame into `dst`, which is empty on entry. Returns `false` once the peer
    /// has closed the stream cleanly.
    async fn read_frame(&mut self, dst: &mut BytesMut) -> Result<bool>;
}

/// The outbound half of a transport. Only one write is ever in flight.
#[async_trait]
pub trait FrameWriter: Send + 'static {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Signals that no more frames will be written.
    async fn complete(&mut self) -> Result<()>;
}

/// A duplex transport owned by the caller until it is handed to a session.
#[async_trait]
pub trait Transport: Send + 'static {
    type Reader: FrameReader;
    type Writer: FrameWriter;

    /// Completes any establishment step. The session is not usable before this returns.
    async fn handshake(&mut self) -> Result<()> {
        Ok(())
    }

    fn split(self) -> (Self::Reader, Self::Writer);
}

/// Frames self-delimiting MessagePack values on a byte stream.
#[derive(Debug)]
pub struct StreamTransport<S> {
    stream: S,
    max_frame_len: usize,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Sets the largest inbound frame accepted before the stream is treated as corrupt.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Reader = StreamFrameReader<ReadHalf<S>>;
    type Writer = StreamFrameWriter<WriteHalf<S>>;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (read_half, write_half) = tokio::io::split(self.stream);
        (
            StreamFrameReader::new(read_half).with_max_frame_len(self.max_frame_len),
            StreamFrameWriter::new(write_half),
        )
    }
}

/// Reads whole frames from a byte stream, buffering partial ones.
#[derive(Debug)]
pub struct StreamFrameReader<R> {
    inner: R,
    buffer: BytesMut,
    scanner: FrameScanner,
    max_frame_len: usize,
}

impl<R> StreamFrameReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(8 * 1024),
            scanner: FrameScanner::new(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

#[async_trait]
impl<R> FrameReader for StreamFrameReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn read_frame(&mut self, dst: &mut BytesMut) -> Result<bool> {
        loop {
            if let Some(len) = self.scanner.scan(&self.buffer)? {
                if len > self.max_frame_len {
                    return Err(ProtocolError::FrameTooLarge(self.max_frame_len).into());
                }
                dst.extend_from_slice(&self.buffer.split_to(len));
                trace!("read frame of {} bytes", len);
                return Ok(true);
            }
            if self.buffer.len() > self.max_frame_len {
                return Err(ProtocolError::FrameTooLarge(self.max_frame_len).into());
            }
            if self.inner.read_buf(&mut self.buffer).await? == 0 {
                if self.buffer.is_empty() {
                    return Ok(false);
                }
                return Err(RpcError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed in the middle of a frame",
                )));
            }
        }
    }
}

/// Writes frames to a byte stream, flushing after each one.
#[derive(Debug)]
pub struct StreamFrameWriter<W> {
    inner: W,
}

impl<W> StreamFrameWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W> FrameWriter for StreamFrameWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        trace!("writing frame of {} bytes", frame.len());
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn complete(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Broadcast, ServerMessage};
    use rmpv::Value;

    fn broadcast_frame(method_id: i32, args: Value) -> Vec<u8> {
        let mut buf = Vec::new();
        ServerMessage::Broadcast(Broadcast { method_id, args })
            .encode(&mut buf)
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_frames_split_across_writes() {
        let (client, mut server) = tokio::io::duplex(64);
        let (mut reader, _writer) = StreamTransport::new(client).split();

        let first = broadcast_frame(1, Value::String("a".repeat(100).into()));
        let second = broadcast_frame(2, Value::Nil);
        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        let writer = tokio::spawn(async move {
            for chunk in stream.chunks(7) {
                server.write_all(chunk).await.unwrap();
            }
            server.shutdown().await.unwrap();
        });

        let mut frame = BytesMut::new();
        assert!(reader.read_frame(&mut frame).await.unwrap());
        assert_eq!(&frame[..], &first[..]);
        frame.clear();
        assert!(reader.read_frame(&mut frame).await.unwrap());
        assert_eq!(&frame[..], &second[..]);
        frame.clear();
        assert!(!reader.read_frame(&mut frame).await.unwrap());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_large_frame_over_small_pipe() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        let (mut reader, _writer) = StreamTransport::new(client).split();
        let frame = broadcast_frame(9, Value::Binary(vec![0x5a; 4 << 20]));
        let expected = frame.clone();
        let writer = tokio::spawn(async move { server.write_all(&frame).await.unwrap() });

        let mut dst = BytesMut::new();
        assert!(reader.read_frame(&mut dst).await.unwrap());
        assert_eq!(dst.len(), expected.len());
        assert_eq!(
            ServerMessage::decode(&dst).unwrap(),
            ServerMessage::Broadcast(Broadcast {
                method_id: 9,
                args: Value::Binary(vec![0x5a; 4 << 20]),
            })
        );
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_frame_at_eof_is_an_error() {
        let (client, mut server) = tokio::io::duplex(64);
        let (mut reader, _writer) = StreamTransport::new(client).split();
        let frame = broadcast_frame(1, Value::String("truncated".into()));
        server.write_all(&frame[..frame.len() - 2]).await.unwrap();
        drop(server);

        let mut dst = BytesMut::new();
        assert!(matches!(
            reader.read_frame(&mut dst).await,
            Err(RpcError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (mut reader, _writer) = StreamTransport::new(client)
            .with_max_frame_len(16)
            .split();
        server
            .write_all(&broadcast_frame(1, Value::Binary(vec![0; 64])))
            .await
            .unwrap();

        let mut dst = BytesMut::new();
        assert!(matches!(
            reader.read_frame(&mut dst).await,
            Err(RpcError::Protocol(ProtocolError::FrameTooLarge(16)))
        ));
    }

    #[tokio::test]
    async fn test_writer_completes_stream() {
        let (client, mut server) = tokio::io::duplex(64);
        let (_reader, mut writer) = StreamTransport::new(client).split();
        writer.write_frame(&[0x92, 0x01, 0xc0]).await.unwrap();
        writer.complete().await.unwrap();

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, vec![0x92, 0x01, 0xc0]);
    }
}
