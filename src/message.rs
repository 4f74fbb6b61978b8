//! Hub session frames and their MessagePack encoding.
//!
//! Every frame is a single MessagePack array. Which envelope an array holds is decided by its
//! arity and, for the tagged shapes, by the first element. Frames written by the client and
//! frames written by the server share arities, so each direction has its own message type:
//! [`ClientMessage`] for client to server and [`ServerMessage`] for server to client.
//!
//! Client to server:
//! - `[MethodId, Args]` fire-and-forget request
//! - `[MessageId, MethodId, Args]` request
//! - `[0x7e, Sequence, ClientSentAt, Nil]` client heartbeat
//! - `[0x7f, Sequence, ServerSentAt, Nil]` server heartbeat acknowledgement
//! - `[0x00, RequestId, MethodId, Result]` client result
//! - `[0x01, RequestId, MethodId, [StatusCode, Detail, Message]]` failed client result
//!
//! Server to client:
//! - `[MethodId, Args]` broadcast
//! - `[MessageId, MethodId, Result]` response
//! - `[MessageId, StatusCode, Detail, Message]` error response
//! - `[0x00, Nil, RequestId, MethodId, Args]` client result request
//! - `[0x7e, Sequence, ClientSentAt, Nil, Nil]` client heartbeat acknowledgement
//! - `[0x7f, Sequence, ServerSentAt, Nil, Metadata]` server heartbeat
use bytes::{BufMut, BytesMut};
use rmp::{encode::ValueWriteError, Marker};
use rmpv::Value;
use std::io::{self, Write};

use crate::{
    error::{ProtocolError, Result, RpcError, ServiceError},
    pool::FramePool,
};

/// Identifies one correlated call within a session.
pub type MessageId = i32;
/// Identifies a hub or receiver method. Fixed when the interface is generated.
pub type MethodId = i32;
/// Heartbeat sequence number. Wraps on overflow.
pub type Sequence = i16;

/// Leading tag of client-initiated heartbeat frames and their acknowledgements.
pub const CLIENT_HEARTBEAT_TAG: MethodId = 0x7e;
/// Leading tag of server-initiated heartbeat frames and their acknowledgements.
pub const SERVER_HEARTBEAT_TAG: MethodId = 0x7f;

const CLIENT_RESULT_TAG: u64 = 0x00;
const CLIENT_RESULT_ERROR_TAG: u64 = 0x01;

/// Returns true if `method_id` collides with a heartbeat tag and so can never name an
/// application method.
pub fn is_reserved_method_id(method_id: MethodId) -> bool {
    method_id == CLIENT_HEARTBEAT_TAG || method_id == SERVER_HEARTBEAT_TAG
}

/// A hub method invocation that expects a response.
#[derive(PartialEq, Clone, Debug)]
pub struct Request {
    pub message_id: MessageId,
    pub method_id: MethodId,
    pub args: Value,
}

/// A hub method invocation with no response.
#[derive(PartialEq, Clone, Debug)]
pub struct FireAndForget {
    pub method_id: MethodId,
    pub args: Value,
}

/// The client's answer to a [`ClientResultRequest`].
#[derive(PartialEq, Clone, Debug)]
pub struct ClientResultResponse {
    /// Opaque id chosen by the server, echoed back verbatim.
    pub request_id: Value,
    pub method_id: MethodId,
    pub result: std::result::Result<Value, ServiceError>,
}

/// Frames written by the client.
#[derive(PartialEq, Clone, Debug)]
pub enum ClientMessage {
    Request(Request),
    FireAndForget(FireAndForget),
    ClientHeartbeat {
        sequence: Sequence,
        /// Milliseconds elapsed since the client's clock origin.
        client_sent_at: i64,
    },
    ServerHeartbeatAck {
        sequence: Sequence,
        /// The server's send time, echoed verbatim.
        server_sent_at: i64,
    },
    ClientResult(ClientResultResponse),
}

/// A successful response to a [`Request`].
#[derive(PartialEq, Clone, Debug)]
pub struct Response {
    pub message_id: MessageId,
    pub method_id: MethodId,
    pub result: Value,
}

/// A server-to-client receiver invocation.
#[derive(PartialEq, Clone, Debug)]
pub struct Broadcast {
    pub method_id: MethodId,
    pub args: Value,
}

/// A server-to-client invocation whose result the server awaits.
#[derive(PartialEq, Clone, Debug)]
pub struct ClientResultRequest {
    pub request_id: Value,
    pub method_id: MethodId,
    pub args: Value,
}

/// Frames written by the server.
#[derive(PartialEq, Clone, Debug)]
pub enum ServerMessage {
    Response(Response),
    ErrorResponse {
        message_id: MessageId,
        error: ServiceError,
    },
    Broadcast(Broadcast),
    ClientResultRequest(ClientResultRequest),
    ClientHeartbeatAck {
        sequence: Sequence,
        /// The client's send time, echoed verbatim.
        client_sent_at: i64,
    },
    ServerHeartbeat {
        sequence: Sequence,
        /// Unix time in milliseconds.
        server_sent_at: i64,
        metadata: Value,
    },
}

impl ClientMessage {
    /// Encodes the message to MessagePack format and writes it to the given writer.
    pub fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            ClientMessage::Request(req) => {
                write_array_len(writer, 3)?;
                write_int(writer, req.message_id.into())?;
                write_int(writer, req.method_id.into())?;
                rmpv::encode::write_value(writer, &req.args)?;
            }
            ClientMessage::FireAndForget(msg) => {
                write_array_len(writer, 2)?;
                write_int(writer, msg.method_id.into())?;
                rmpv::encode::write_value(writer, &msg.args)?;
            }
            ClientMessage::ClientHeartbeat {
                sequence,
                client_sent_at,
            } => {
                write_array_len(writer, 4)?;
                write_int(writer, CLIENT_HEARTBEAT_TAG.into())?;
                write_int(writer, (*sequence).into())?;
                write_int(writer, *client_sent_at)?;
                rmp::encode::write_nil(writer)?;
            }
            ClientMessage::ServerHeartbeatAck {
                sequence,
                server_sent_at,
            } => {
                write_array_len(writer, 4)?;
                write_int(writer, SERVER_HEARTBEAT_TAG.into())?;
                write_int(writer, (*sequence).into())?;
                write_int(writer, *server_sent_at)?;
                rmp::encode::write_nil(writer)?;
            }
            ClientMessage::ClientResult(resp) => {
                write_array_len(writer, 4)?;
                let tag = match resp.result {
                    Ok(_) => CLIENT_RESULT_TAG,
                    Err(_) => CLIENT_RESULT_ERROR_TAG,
                };
                write_int(writer, tag as i64)?;
                rmpv::encode::write_value(writer, &resp.request_id)?;
                write_int(writer, resp.method_id.into())?;
                match &resp.result {
                    Ok(value) => rmpv::encode::write_value(writer, value)?,
                    Err(err) => rmpv::encode::write_value(writer, &Value::from(err.clone()))?,
                }
            }
        }
        Ok(())
    }

    /// Encodes the message into a buffer rented from `pool`.
    pub fn to_frame(&self, pool: &FramePool) -> Result<BytesMut> {
        let mut writer = pool.rent().writer();
        self.encode(&mut writer)?;
        Ok(writer.into_inner())
    }

    /// Decodes a single client frame. This is the server's view of the stream.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        Self::from_value(read_frame_value(frame)?)
    }

    /// Creates a ClientMessage from a decoded frame array.
    pub fn from_value(value: Value) -> Result<Self> {
        let array = into_array(value)?;
        match array.len() {
            2 => Ok(ClientMessage::FireAndForget(FireAndForget {
                method_id: int_at(&array, 0, "method id")?,
                args: array[1].clone(),
            })),
            3 => Ok(ClientMessage::Request(Request {
                message_id: int_at(&array, 0, "message id")?,
                method_id: int_at(&array, 1, "method id")?,
                args: array[2].clone(),
            })),
            4 => match tag_at(&array)? {
                CLIENT_RESULT_TAG => Ok(ClientMessage::ClientResult(ClientResultResponse {
                    request_id: array[1].clone(),
                    method_id: int_at(&array, 2, "client result method id")?,
                    result: Ok(array[3].clone()),
                })),
                CLIENT_RESULT_ERROR_TAG => Ok(ClientMessage::ClientResult(ClientResultResponse {
                    request_id: array[1].clone(),
                    method_id: int_at(&array, 2, "client result method id")?,
                    result: Err(service_error_from_value(&array[3])?),
                })),
                tag if tag == CLIENT_HEARTBEAT_TAG as u64 => Ok(ClientMessage::ClientHeartbeat {
                    sequence: int_at(&array, 1, "heartbeat sequence")?,
                    client_sent_at: timestamp_at(&array, &[2, 3])
                        .ok_or(ProtocolError::from("invalid client heartbeat timestamp"))?,
                }),
                tag if tag == SERVER_HEARTBEAT_TAG as u64 => Ok(ClientMessage::ServerHeartbeatAck {
                    sequence: int_at(&array, 1, "heartbeat sequence")?,
                    server_sent_at: timestamp_at(&array, &[2])
                        .ok_or(ProtocolError::from("invalid server heartbeat timestamp"))?,
                }),
                tag => Err(ProtocolError::UnknownTag(tag).into()),
            },
            n => Err(ProtocolError::UnexpectedArity(n).into()),
        }
    }
}

impl ServerMessage {
    /// Encodes the message to MessagePack format and writes it to the given writer.
    pub fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            ServerMessage::Response(resp) => {
                write_array_len(writer, 3)?;
                write_int(writer, resp.message_id.into())?;
                write_int(writer, resp.method_id.into())?;
                rmpv::encode::write_value(writer, &resp.result)?;
            }
            ServerMessage::ErrorResponse { message_id, error } => {
                write_array_len(writer, 4)?;
                write_int(writer, (*message_id).into())?;
                write_int(writer, error.status_code.into())?;
                rmp::encode::write_str(writer, &error.detail).map_err(header_error)?;
                match &error.message {
                    Some(message) => rmp::encode::write_str(writer, message).map_err(header_error)?,
                    None => rmp::encode::write_nil(writer)?,
                }
            }
            ServerMessage::Broadcast(msg) => {
                write_array_len(writer, 2)?;
                write_int(writer, msg.method_id.into())?;
                rmpv::encode::write_value(writer, &msg.args)?;
            }
            ServerMessage::ClientResultRequest(req) => {
                write_array_len(writer, 5)?;
                write_int(writer, CLIENT_RESULT_TAG as i64)?;
                rmp::encode::write_nil(writer)?;
                rmpv::encode::write_value(writer, &req.request_id)?;
                write_int(writer, req.method_id.into())?;
                rmpv::encode::write_value(writer, &req.args)?;
            }
            ServerMessage::ClientHeartbeatAck {
                sequence,
                client_sent_at,
            } => {
                write_array_len(writer, 5)?;
                write_int(writer, CLIENT_HEARTBEAT_TAG.into())?;
                write_int(writer, (*sequence).into())?;
                write_int(writer, *client_sent_at)?;
                rmp::encode::write_nil(writer)?;
                rmp::encode::write_nil(writer)?;
            }
            ServerMessage::ServerHeartbeat {
                sequence,
                server_sent_at,
                metadata,
            } => {
                write_array_len(writer, 5)?;
                write_int(writer, SERVER_HEARTBEAT_TAG.into())?;
                write_int(writer, (*sequence).into())?;
                write_int(writer, *server_sent_at)?;
                rmp::encode::write_nil(writer)?;
                rmpv::encode::write_value(writer, metadata)?;
            }
        }
        Ok(())
    }

    /// Encodes the message into a buffer rented from `pool`.
    pub fn to_frame(&self, pool: &FramePool) -> Result<BytesMut> {
        let mut writer = pool.rent().writer();
        self.encode(&mut writer)?;
        Ok(writer.into_inner())
    }

    /// Decodes a single server frame. This is the client's view of the stream.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        Self::from_value(read_frame_value(frame)?)
    }

    /// Creates a ServerMessage from a decoded frame array.
    pub fn from_value(value: Value) -> Result<Self> {
        let array = into_array(value)?;
        match array.len() {
            2 => Ok(ServerMessage::Broadcast(Broadcast {
                method_id: int_at(&array, 0, "method id")?,
                args: array[1].clone(),
            })),
            3 => Ok(ServerMessage::Response(Response {
                message_id: int_at(&array, 0, "message id")?,
                method_id: int_at(&array, 1, "method id")?,
                result: array[2].clone(),
            })),
            4 => Ok(ServerMessage::ErrorResponse {
                message_id: int_at(&array, 0, "message id")?,
                error: ServiceError {
                    status_code: int_at(&array, 1, "status code")?,
                    detail: optional_str_at(&array, 2, "error detail")?.unwrap_or_default(),
                    message: optional_str_at(&array, 3, "error message")?
                        .filter(|message| !message.is_empty()),
                },
            }),
            5 => match tag_at(&array)? {
                CLIENT_RESULT_TAG => Ok(ServerMessage::ClientResultRequest(ClientResultRequest {
                    request_id: array[2].clone(),
                    method_id: int_at(&array, 3, "client result method id")?,
                    args: array[4].clone(),
                })),
                tag if tag == CLIENT_HEARTBEAT_TAG as u64 => Ok(ServerMessage::ClientHeartbeatAck {
                    sequence: int_at(&array, 1, "heartbeat sequence")?,
                    // Peers place the echoed time at index 2; index 4 is accepted for peers that
                    // use the trailing slot instead.
                    client_sent_at: timestamp_at(&array, &[2, 4])
                        .ok_or(ProtocolError::from("invalid client heartbeat timestamp"))?,
                }),
                tag if tag == SERVER_HEARTBEAT_TAG as u64 => Ok(ServerMessage::ServerHeartbeat {
                    sequence: int_at(&array, 1, "heartbeat sequence")?,
                    server_sent_at: timestamp_at(&array, &[2])
                        .ok_or(ProtocolError::from("invalid server heartbeat timestamp"))?,
                    metadata: array[4].clone(),
                }),
                tag => Err(ProtocolError::UnknownTag(tag).into()),
            },
            n => Err(ProtocolError::UnexpectedArity(n).into()),
        }
    }
}

/// Returns the length of the first complete frame in `buf`, or `None` if more bytes are needed.
///
/// Frames are self-delimiting MessagePack values, so a byte stream can carry them back to back.
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>> {
    FrameScanner::new().scan(buf)
}

/// Finds frame boundaries in a growing buffer by walking MessagePack markers.
///
/// No values are built and payloads are skipped by length. Progress is kept between calls, so
/// each byte of a frame is examined once however many reads it arrives in.
#[derive(Debug, Default)]
pub struct FrameScanner {
    /// Bytes of the current frame scanned so far.
    offset: usize,
    /// Items still to be read at each open nesting level, innermost last.
    remaining: Vec<u64>,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continues scanning the frame at the start of `buf`. `buf` must hold the same prefix as on
    /// the previous call, possibly followed by more bytes. Returns the frame length once the frame
    /// is complete and resets for the next one.
    pub fn scan(&mut self, buf: &[u8]) -> Result<Option<usize>> {
        if self.remaining.is_empty() {
            self.offset = 0;
            self.remaining.push(1);
        }
        loop {
            let Some(item) = item_at(&buf[self.offset.min(buf.len())..])? else {
                return Ok(None);
            };
            let end = self
                .offset
                .saturating_add(item.header)
                .saturating_add(item.payload);
            if end > buf.len() {
                return Ok(None);
            }
            self.offset = end;
            if let Some(level) = self.remaining.last_mut() {
                *level -= 1;
            }
            if item.children > 0 {
                self.remaining.push(item.children);
            }
            while self.remaining.last() == Some(&0) {
                self.remaining.pop();
            }
            if self.remaining.is_empty() {
                return Ok(Some(self.offset));
            }
        }
    }
}

/// The encoded shape of one MessagePack item.
struct Item {
    /// Marker and length bytes.
    header: usize,
    /// Raw bytes following the header, including an extension's type byte.
    payload: usize,
    /// Nested items that follow: array elements, or keys and values of a map.
    children: u64,
}

impl Item {
    fn scalar(header: usize) -> Self {
        Self {
            header,
            payload: 0,
            children: 0,
        }
    }

    fn bytes(header: usize, payload: usize) -> Self {
        Self {
            header,
            payload,
            children: 0,
        }
    }

    fn nested(header: usize, children: u64) -> Self {
        Self {
            header,
            payload: 0,
            children,
        }
    }
}

/// Reads the item header at the start of `buf`. `None` if the header itself is incomplete.
fn item_at(buf: &[u8]) -> Result<Option<Item>> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    // Big-endian length stored in the `width` bytes after the marker.
    let len = |width: usize| -> Option<usize> {
        buf.get(1..1 + width)
            .map(|bytes| bytes.iter().fold(0usize, |len, b| (len << 8) | *b as usize))
    };
    let item = match Marker::from_u8(first) {
        Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => {
            Item::scalar(1)
        }
        Marker::U8 | Marker::I8 => Item::scalar(2),
        Marker::U16 | Marker::I16 => Item::scalar(3),
        Marker::U32 | Marker::I32 | Marker::F32 => Item::scalar(5),
        Marker::U64 | Marker::I64 | Marker::F64 => Item::scalar(9),
        Marker::FixStr(n) => Item::bytes(1, n as usize),
        Marker::Str8 | Marker::Bin8 => match len(1) {
            Some(n) => Item::bytes(2, n),
            None => return Ok(None),
        },
        Marker::Str16 | Marker::Bin16 => match len(2) {
            Some(n) => Item::bytes(3, n),
            None => return Ok(None),
        },
        Marker::Str32 | Marker::Bin32 => match len(4) {
            Some(n) => Item::bytes(5, n),
            None => return Ok(None),
        },
        Marker::FixArray(n) => Item::nested(1, n as u64),
        Marker::Array16 => match len(2) {
            Some(n) => Item::nested(3, n as u64),
            None => return Ok(None),
        },
        Marker::Array32 => match len(4) {
            Some(n) => Item::nested(5, n as u64),
            None => return Ok(None),
        },
        Marker::FixMap(n) => Item::nested(1, 2 * n as u64),
        Marker::Map16 => match len(2) {
            Some(n) => Item::nested(3, 2 * n as u64),
            None => return Ok(None),
        },
        Marker::Map32 => match len(4) {
            Some(n) => Item::nested(5, 2 * n as u64),
            None => return Ok(None),
        },
        Marker::FixExt1 => Item::bytes(1, 2),
        Marker::FixExt2 => Item::bytes(1, 3),
        Marker::FixExt4 => Item::bytes(1, 5),
        Marker::FixExt8 => Item::bytes(1, 9),
        Marker::FixExt16 => Item::bytes(1, 17),
        Marker::Ext8 => match len(1) {
            Some(n) => Item::bytes(2, n + 1),
            None => return Ok(None),
        },
        Marker::Ext16 => match len(2) {
            Some(n) => Item::bytes(3, n + 1),
            None => return Ok(None),
        },
        Marker::Ext32 => match len(4) {
            Some(n) => Item::bytes(5, n + 1),
            None => return Ok(None),
        },
        Marker::Reserved => {
            return Err(ProtocolError::InvalidFrame(format!("reserved marker {:#04x}", first)).into());
        }
    };
    Ok(Some(item))
}

fn read_frame_value(frame: &[u8]) -> Result<Value> {
    let mut reader = frame;
    let value = rmpv::decode::read_value(&mut reader)
        .map_err(|e| ProtocolError::InvalidFrame(format!("undecodable frame: {}", e)))?;
    if !reader.is_empty() {
        return Err(ProtocolError::from("trailing bytes after frame").into());
    }
    Ok(value)
}

fn into_array(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(array) if array.is_empty() => {
            Err(ProtocolError::from("empty frame array").into())
        }
        Value::Array(array) => Ok(array),
        _ => Err(ProtocolError::from("frame is not an array").into()),
    }
}

fn tag_at(array: &[Value]) -> Result<u64> {
    array[0]
        .as_u64()
        .ok_or_else(|| ProtocolError::from("invalid message type tag").into())
}

fn int_at<T: TryFrom<i64>>(array: &[Value], index: usize, field: &str) -> Result<T> {
    array
        .get(index)
        .and_then(Value::as_i64)
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| ProtocolError::InvalidFrame(format!("invalid {}", field)).into())
}

fn optional_str_at(array: &[Value], index: usize, field: &str) -> Result<Option<String>> {
    match array.get(index) {
        None | Some(Value::Nil) => Ok(None),
        Some(value) => value
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| ProtocolError::InvalidFrame(format!("invalid {}", field)).into()),
    }
}

/// Reads a timestamp from the first of `indices` that holds one, accepting either a bare integer
/// or a single-element array wrapping it.
fn timestamp_at(array: &[Value], indices: &[usize]) -> Option<i64> {
    indices.iter().find_map(|&index| match array.get(index)? {
        Value::Integer(value) => value.as_i64(),
        Value::Array(inner) if inner.len() == 1 => inner[0].as_i64(),
        _ => None,
    })
}

fn service_error_from_value(value: &Value) -> Result<ServiceError> {
    match value {
        Value::Array(fields) if fields.len() == 3 => Ok(ServiceError {
            status_code: int_at(fields, 0, "status code")?,
            detail: optional_str_at(fields, 1, "error detail")?.unwrap_or_default(),
            message: optional_str_at(fields, 2, "error message")?,
        }),
        _ => Err(ProtocolError::from("invalid client result error body").into()),
    }
}

fn write_array_len<W: Write>(writer: &mut W, len: u32) -> Result<()> {
    rmp::encode::write_array_len(writer, len).map_err(header_error)?;
    Ok(())
}

fn write_int<W: Write>(writer: &mut W, value: i64) -> Result<()> {
    rmp::encode::write_sint(writer, value).map_err(header_error)?;
    Ok(())
}

fn header_error(err: ValueWriteError<io::Error>) -> RpcError {
    match err {
        ValueWriteError::InvalidMarkerWrite(e) | ValueWriteError::InvalidDataWrite(e) => {
            RpcError::Io(e)
        }
    }
}
