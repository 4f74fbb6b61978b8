use rmpv::Value;
use std::io;
use thiserror::Error;

use crate::{lifecycle::DisconnectionReason, message::MethodId, message::MessageId};

/// Errors that can occur during hub session operations.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Error occurred during I/O on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error occurred during MessagePack serialization.
    #[error("Serialization error: {0}")]
    Serialization(#[from] rmpv::encode::Error),

    /// Error occurred during MessagePack deserialization.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] rmpv::decode::Error),

    /// Error occurred while encoding a typed value.
    #[cfg(feature = "serde")]
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Error occurred while decoding a typed value.
    #[cfg(feature = "serde")]
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The peer violated the session protocol. Framing can no longer be trusted.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The hub answered a call with an error.
    #[error("Service error: {0}")]
    Service(ServiceError),

    /// The transport could not be established.
    #[error("Connection failed: {source}")]
    Connect {
        #[source]
        source: io::Error,
    },

    /// The transport rejected the session handshake.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The session is disconnected, or was torn down while the call was pending.
    #[error("Session disconnected: {reason}")]
    Disconnected { reason: DisconnectionReason },

    /// The session was disposed by its owner.
    #[error("Session has already been disposed")]
    Disposed,

    /// The caller cancelled this call. The session is unaffected.
    #[error("Call was cancelled")]
    Cancelled,

    /// A receiver method or heartbeat observer panicked on the dispatcher.
    #[error("Session task panicked: {0}")]
    Panicked(String),
}

/// Ways in which the peer can break the framing contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("unexpected frame arity {0}")]
    UnexpectedArity(usize),

    #[error("unknown message type tag {0:#04x}")]
    UnknownTag(u64),

    #[error("no receiver method registered for method id {0}")]
    UnknownMethod(MethodId),

    #[error("method id {0} is reserved for heartbeat frames")]
    ReservedMethodId(MethodId),

    #[error("response to message {message_id} carried method id {actual}, expected {expected}")]
    MethodMismatch {
        message_id: MessageId,
        expected: MethodId,
        actual: MethodId,
    },

    #[error("message id {0} already has a pending call")]
    DuplicateMessageId(MessageId),

    #[error("frame exceeds maximum length of {0} bytes")]
    FrameTooLarge(usize),
}

impl From<&str> for ProtocolError {
    fn from(detail: &str) -> Self {
        ProtocolError::InvalidFrame(detail.to_string())
    }
}

impl From<String> for ProtocolError {
    fn from(detail: String) -> Self {
        ProtocolError::InvalidFrame(detail)
    }
}

/// An error reported by the remote side for a single invocation.
///
/// Hub calls fail with one of these when the server answers with an error response. Client-result
/// receiver methods return one to report failure back to the server. On the wire it is the array
/// `[status_code, detail, message]`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    pub status_code: i32,
    pub detail: String,
    pub message: Option<String>,
}

impl ServiceError {
    /// gRPC-style status code used when no receiver method handles a client-result request.
    pub const UNIMPLEMENTED: i32 = 12;
    /// gRPC-style status code for failures raised inside a receiver method.
    pub const INTERNAL: i32 = 13;

    pub fn new(status_code: i32, detail: impl Into<String>) -> Self {
        Self {
            status_code,
            detail: detail.into(),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "status {}: {}", self.status_code, self.detail)?;
        if let Some(message) = &self.message {
            write!(f, " ({})", message)?;
        }
        Ok(())
    }
}

impl From<ServiceError> for Value {
    fn from(error: ServiceError) -> Self {
        Value::Array(vec![
            Value::from(error.status_code),
            Value::String(error.detail.into()),
            match error.message {
                Some(message) => Value::String(message.into()),
                None => Value::Nil,
            },
        ])
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
