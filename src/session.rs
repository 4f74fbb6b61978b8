//! The session handle exposed to application code.
#[cfg(feature = "serde")]
use std::io::Cursor;
use std::sync::{
    atomic::{AtomicBool, AtomicI32, Ordering},
    Arc, Mutex, PoisonError,
};

use rmpv::Value;
#[cfg(feature = "serde")]
use rmpv::{decode::read_value, encode::write_value};
#[cfg(feature = "serde")]
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::{
    dispatcher::{
        run_reader, run_ticker, run_writer, supervise_dispatcher, Dispatcher, SessionShared,
    },
    error::{ProtocolError, Result, RpcError},
    heartbeat::HeartbeatEngine,
    lifecycle::{DisconnectionReason, SessionState},
    message::{is_reserved_method_id, ClientMessage, FireAndForget, MessageId, MethodId, Request},
    options::SessionOptions,
    pending::PendingCallTable,
    pool::FramePool,
    receiver::ReceiverTable,
    transport::{StreamTransport, Transport},
};

/// A multiplexed duplex session with a hub.
///
/// Any number of calls may be in flight at once; responses are matched to calls by message id,
/// in whatever order they arrive. The session ends exactly once, when it is disposed, when the
/// server closes the stream, when heartbeats time out or when the transport or the peer fails.
/// Every call still pending at that point fails with the recorded [`DisconnectionReason`].
///
/// Dropping the session disconnects it without waiting for its tasks.
#[derive(Debug)]
pub struct Session {
    shared: Arc<SessionShared>,
    next_message_id: AtomicI32,
    disposed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Completes the transport's handshake and starts the session.
    pub async fn connect<T: Transport>(
        mut transport: T,
        receivers: ReceiverTable,
        options: SessionOptions,
    ) -> Result<Self> {
        receivers.validate()?;
        transport.handshake().await?;
        let (reader, writer) = transport.split();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared::new(
            FramePool::new(options.frame_pool_size),
            outbound_tx,
        ));
        let heartbeat = HeartbeatEngine::new(&options);

        let mut tasks = vec![
            tokio::spawn(run_writer(writer, outbound_rx, shared.clone())),
            tokio::spawn(run_reader(reader, events_tx.clone(), shared.clone())),
        ];
        if let Some(interval) = heartbeat.interval() {
            tasks.push(tokio::spawn(run_ticker(
                heartbeat.clock(),
                interval,
                events_tx.clone(),
                shared.shutdown.clone(),
            )));
        }
        drop(events_tx);
        let dispatcher = tokio::spawn(
            Dispatcher::new(shared.clone(), receivers, heartbeat, events_rx).run(),
        );
        tasks.push(tokio::spawn(supervise_dispatcher(dispatcher, shared.clone())));
        debug!("session connected: {:?}", options);

        Ok(Self {
            shared,
            next_message_id: AtomicI32::new(1),
            disposed: AtomicBool::new(false),
            tasks: Mutex::new(tasks),
        })
    }

    /// Connects to a hub over TCP.
    pub async fn connect_tcp(
        addr: &str,
        receivers: ReceiverTable,
        options: SessionOptions,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| RpcError::Connect { source })?;
        stream
            .set_nodelay(true)
            .map_err(|source| RpcError::Connect { source })?;
        trace!("TCP connection established to: {}", addr);
        Self::connect(StreamTransport::new(stream), receivers, options).await
    }

    /// Connects to a hub over a Unix domain socket.
    #[cfg(unix)]
    pub async fn connect_unix<P: AsRef<std::path::Path>>(
        path: P,
        receivers: ReceiverTable,
        options: SessionOptions,
    ) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let stream = tokio::net::UnixStream::connect(path)
            .await
            .map_err(|source| RpcError::Connect { source })?;
        trace!("Unix connection established to: {:?}", path_str);
        Self::connect(StreamTransport::new(stream), receivers, options).await
    }

    /// Calls a hub method and waits for its result.
    pub async fn call(&self, method_id: MethodId, args: Value) -> Result<Value> {
        self.invoke(method_id, args, None).await
    }

    /// Calls a hub method, giving up with [`RpcError::Cancelled`] if `cancel` fires first. The
    /// request is still delivered and the session is unaffected.
    pub async fn call_with_cancellation(
        &self,
        method_id: MethodId,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.invoke(method_id, args, Some(cancel)).await
    }

    /// Invokes a hub method without waiting for, or receiving, a result.
    pub fn fire_and_forget(&self, method_id: MethodId, args: Value) -> Result<()> {
        self.ensure_usable()?;
        check_method_id(method_id)?;
        self.shared
            .send(&ClientMessage::FireAndForget(FireAndForget { method_id, args }))
            .map_err(|e| self.disposed_or(e))
    }

    /// Calls a hub method with serde-encoded arguments and decodes the result.
    #[cfg(feature = "serde")]
    pub async fn call_typed<Req, Resp>(&self, method_id: MethodId, req: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let value = self.call(method_id, serialize_args(req)?).await?;
        deserialize_result(&value)
    }

    /// Invokes a hub method with serde-encoded arguments, without waiting for a result.
    #[cfg(feature = "serde")]
    pub fn fire_and_forget_typed<Req>(&self, method_id: MethodId, req: &Req) -> Result<()>
    where
        Req: Serialize,
    {
        self.fire_and_forget(method_id, serialize_args(req)?)
    }

    pub fn state(&self) -> SessionState {
        self.shared.lifecycle.state()
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Resolves once the session has ended. Later callers get the recorded reason immediately.
    pub async fn wait_for_disconnect(&self) -> DisconnectionReason {
        self.shared.lifecycle.wait_for_disconnect().await
    }

    /// Shuts the session down and waits for its tasks to finish. A session that already ended
    /// keeps its original reason. Calling this more than once is harmless.
    pub async fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            debug!("disposing session");
        }
        self.shared.disconnect(DisconnectionReason::CompletedNormally);
        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("session task panicked: {}", e);
                }
            }
        }
    }

    async fn invoke(
        &self,
        method_id: MethodId,
        args: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value> {
        self.ensure_usable()?;
        check_method_id(method_id)?;
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(RpcError::Cancelled);
        }

        let (message_id, receiver, _guard) = self.start_call(method_id, args)?;
        let result = match cancel {
            Some(cancel) => tokio::select! {
                biased;
                result = receiver => result,
                _ = cancel.cancelled() => {
                    trace!("call {} cancelled", message_id);
                    return Err(RpcError::Cancelled);
                }
            },
            None => receiver.await,
        };
        // The slot only closes unresolved if the session was torn down underneath the call.
        result.unwrap_or_else(|_| Err(self.shared.disconnected_error()))
    }

    /// Registers a call and queues its request.
    fn start_call(
        &self,
        method_id: MethodId,
        args: Value,
    ) -> Result<(MessageId, oneshot::Receiver<Result<Value>>, PendingGuard<'_>)> {
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let receiver = self
            .shared
            .pending
            .register(message_id, method_id)
            .map_err(|e| self.disposed_or(e))?;
        let guard = PendingGuard {
            pending: &self.shared.pending,
            message_id,
        };
        self.shared
            .send(&ClientMessage::Request(Request {
                message_id,
                method_id,
                args,
            }))
            .map_err(|e| self.disposed_or(e))?;
        Ok((message_id, receiver, guard))
    }

    /// A call that lost the race with `dispose` reports the session as disposed.
    fn disposed_or(&self, error: RpcError) -> RpcError {
        match error {
            RpcError::Disconnected { .. } if self.is_disposed() => RpcError::Disposed,
            error => error,
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(RpcError::Disposed);
        }
        match self.shared.lifecycle.state() {
            SessionState::Connected => Ok(()),
            SessionState::Disconnected(reason) => Err(RpcError::Disconnected { reason }),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disposed.store(true, Ordering::Release);
        self.shared.disconnect(DisconnectionReason::CompletedNormally);
    }
}

/// Removes a call from the pending table if its caller stops waiting.
struct PendingGuard<'a> {
    pending: &'a PendingCallTable,
    message_id: MessageId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.take(self.message_id);
    }
}

fn check_method_id(method_id: MethodId) -> Result<()> {
    if is_reserved_method_id(method_id) {
        return Err(ProtocolError::ReservedMethodId(method_id).into());
    }
    Ok(())
}

/// Serializes typed arguments into a single MessagePack value.
#[cfg(feature = "serde")]
fn serialize_args<Req>(req: &Req) -> Result<Value>
where
    Req: Serialize,
{
    let buf = rmp_serde::to_vec(req)?;
    Ok(read_value(&mut Cursor::new(buf))?)
}

/// Deserializes a typed result from a MessagePack value.
#[cfg(feature = "serde")]
fn deserialize_result<Resp>(value: &Value) -> Result<Resp>
where
    Resp: DeserializeOwned,
{
    let mut buf = Vec::new();
    write_value(&mut buf, value)?;
    Ok(rmp_serde::from_slice(&buf)?)
}
