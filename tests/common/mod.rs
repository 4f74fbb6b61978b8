//! An in-memory hub that speaks the server side of the session protocol.
#![allow(dead_code)]

use bytes::BytesMut;
use mhub::{
    ClientMessage, FrameReader, FrameWriter, ReceiverTable, ServerMessage, Session,
    SessionOptions, StreamFrameReader, StreamFrameWriter, StreamTransport, Transport, Value,
};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

pub struct TestHub {
    reader: StreamFrameReader<ReadHalf<DuplexStream>>,
    writer: StreamFrameWriter<WriteHalf<DuplexStream>>,
}

impl TestHub {
    /// Reads the next frame the client wrote, or `None` once the client closed its side.
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        let mut frame = BytesMut::new();
        if self.reader.read_frame(&mut frame).await.unwrap() {
            Some(ClientMessage::decode(&frame).unwrap())
        } else {
            None
        }
    }

    pub async fn send(&mut self, message: ServerMessage) {
        let mut buf = Vec::new();
        message.encode(&mut buf).unwrap();
        self.writer.write_frame(&buf).await.unwrap();
    }

    pub async fn send_raw(&mut self, frame: &[u8]) {
        self.writer.write_frame(frame).await.unwrap();
    }

    /// Closes the hub's side of the stream.
    pub async fn close(&mut self) {
        self.writer.complete().await.unwrap();
    }
}

/// Opens a session against a fresh in-memory hub.
pub async fn connect(receivers: ReceiverTable, options: SessionOptions) -> (Session, TestHub) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let session = Session::connect(StreamTransport::new(client), receivers, options)
        .await
        .unwrap();
    let (reader, writer) = StreamTransport::new(server).split();
    (session, TestHub { reader, writer })
}

pub fn text(s: &str) -> Value {
    Value::String(s.into())
}
