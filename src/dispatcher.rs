//! The tasks that drive a session.
//!
//! Each session runs up to four tasks:
//!
//! - the reader pulls frames from the transport, decodes them and queues a [`SessionEvent`]
//! - the ticker queues a [`SessionEvent::HeartbeatTick`] once per heartbeat interval
//! - the dispatcher consumes the event queue and owns the heartbeat engine, so ticks,
//!   acknowledgements and the timeout check never race each other
//! - the writer is the only code that touches the outbound half of the transport
//!
//! Callers and the dispatcher hand encoded frames to the writer through an unbounded queue.
use std::{sync::Arc, time::Duration};

use bytes::BytesMut;
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    task::{JoinError, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{
    clock::Clock,
    error::{ProtocolError, Result, RpcError, ServiceError},
    heartbeat::HeartbeatEngine,
    lifecycle::{DisconnectionReason, Lifecycle},
    message::{Broadcast, ClientMessage, ClientResultRequest, ClientResultResponse, Response, ServerMessage},
    pending::PendingCallTable,
    pool::FramePool,
    receiver::{ReceiverMethod, ReceiverTable},
    transport::{FrameReader, FrameWriter},
};

/// How long a normal shutdown waits for queued frames to reach the transport.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Inputs to the dispatcher loop.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Message(ServerMessage),
    HeartbeatTick,
    /// The server closed the stream cleanly.
    ReaderClosed,
    ReaderFailed(RpcError),
}

/// State shared between the session handle and its tasks.
#[derive(Debug)]
pub(crate) struct SessionShared {
    pub(crate) lifecycle: Lifecycle,
    pub(crate) pending: PendingCallTable,
    pub(crate) pool: FramePool,
    pub(crate) outbound: UnboundedSender<BytesMut>,
    /// Cancelled once the session leaves `Connected`. Stops every task.
    pub(crate) shutdown: CancellationToken,
}

impl SessionShared {
    pub(crate) fn new(pool: FramePool, outbound: UnboundedSender<BytesMut>) -> Self {
        Self {
            lifecycle: Lifecycle::new(),
            pending: PendingCallTable::new(),
            pool,
            outbound,
            shutdown: CancellationToken::new(),
        }
    }

    /// Encodes `message` and queues it for the writer.
    pub(crate) fn send(&self, message: &ClientMessage) -> Result<()> {
        let frame = message.to_frame(&self.pool)?;
        self.outbound
            .send(frame)
            .map_err(|_| self.disconnected_error())
    }

    /// Ends the session. Only the first reason is recorded; every pending call fails with it.
    pub(crate) fn disconnect(&self, reason: DisconnectionReason) {
        if self.lifecycle.transition(reason.clone()) {
            match &reason {
                DisconnectionReason::Faulted(e) => error!("session faulted: {}", e),
                DisconnectionReason::TimedOut => debug!("session timed out"),
                DisconnectionReason::CompletedNormally => {}
            }
        }
        self.shutdown.cancel();
        let recorded = self.lifecycle.state().reason().cloned().unwrap_or(reason);
        let drained = self.pending.drain_all(&recorded);
        if drained > 0 {
            debug!("failed {} pending calls: {}", drained, recorded);
        }
    }

    pub(crate) fn disconnected_error(&self) -> RpcError {
        RpcError::Disconnected {
            reason: self
                .lifecycle
                .state()
                .reason()
                .cloned()
                .unwrap_or(DisconnectionReason::CompletedNormally),
        }
    }
}

/// Reads and decodes inbound frames until the stream ends, fails or the session shuts down.
pub(crate) async fn run_reader<R: FrameReader>(
    mut reader: R,
    events: UnboundedSender<SessionEvent>,
    shared: Arc<SessionShared>,
) {
    loop {
        let mut frame = shared.pool.rent();
        let read = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => None,
            read = reader.read_frame(&mut frame) => Some(read),
        };
        let event = match read {
            None => {
                shared.pool.recycle(frame);
                return;
            }
            Some(Ok(true)) => {
                let decoded = ServerMessage::decode(&frame);
                shared.pool.recycle(frame);
                match decoded {
                    Ok(message) => {
                        trace!("received {:?}", message);
                        SessionEvent::Message(message)
                    }
                    Err(e) => SessionEvent::ReaderFailed(e),
                }
            }
            Some(Ok(false)) => SessionEvent::ReaderClosed,
            Some(Err(e)) => SessionEvent::ReaderFailed(e),
        };
        let last = !matches!(event, SessionEvent::Message(_));
        if events.send(event).is_err() || last {
            return;
        }
    }
}

/// Queues a heartbeat tick every `interval` of `clock` time, starting one interval from now.
/// A tick that runs a whole interval late restarts the schedule from the current time.
pub(crate) async fn run_ticker(
    clock: Arc<dyn Clock>,
    interval: Duration,
    events: UnboundedSender<SessionEvent>,
    shutdown: CancellationToken,
) {
    let mut next = clock.now() + interval;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = clock.sleep_until(next) => {}
        }
        if events.send(SessionEvent::HeartbeatTick).is_err() {
            return;
        }
        let now = clock.now();
        next = if now >= next + interval {
            now + interval
        } else {
            next + interval
        };
    }
}

/// Faults the session if the dispatcher dies without recording a reason, which happens when a
/// receiver method or heartbeat observer panics.
pub(crate) async fn supervise_dispatcher(dispatcher: JoinHandle<()>, shared: Arc<SessionShared>) {
    if let Err(e) = dispatcher.await {
        let message = task_failure(e);
        error!("dispatcher stopped: {}", message);
        shared.disconnect(DisconnectionReason::Faulted(Arc::new(RpcError::Panicked(
            message,
        ))));
    }
}

fn task_failure(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(_) => "panic with a non-string payload".to_string(),
        },
    }
}

/// Writes queued frames one at a time.
///
/// On a normal shutdown, frames queued before the shutdown are still written if that finishes
/// within [`DRAIN_TIMEOUT`]. A write failure faults the session.
pub(crate) async fn run_writer<W: FrameWriter>(
    mut writer: W,
    mut outbound: UnboundedReceiver<BytesMut>,
    shared: Arc<SessionShared>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let result = {
            let write = writer.write_frame(&frame);
            tokio::pin!(write);
            let finished = tokio::select! {
                result = &mut write => Some(result),
                _ = shared.shutdown.cancelled() => None,
            };
            match finished {
                Some(result) => Some(result),
                // Let the in-flight write finish so the stream is not cut mid-frame.
                None => tokio::time::timeout(DRAIN_TIMEOUT, write).await.ok(),
            }
        };
        shared.pool.recycle(frame);
        match result {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                shared.disconnect(DisconnectionReason::Faulted(Arc::new(e)));
                return;
            }
            None => {
                debug!("abandoned a frame write at shutdown");
                return;
            }
        }
    }

    let graceful = matches!(
        shared.lifecycle.state().reason(),
        Some(DisconnectionReason::CompletedNormally)
    );
    let finish = async {
        if graceful {
            while let Ok(frame) = outbound.try_recv() {
                writer.write_frame(&frame).await?;
                shared.pool.recycle(frame);
            }
        }
        writer.complete().await?;
        Ok::<_, RpcError>(())
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, finish).await {
        Ok(Ok(())) => trace!("writer completed"),
        Ok(Err(e)) => debug!("error completing writer: {}", e),
        Err(_) => debug!("timed out completing writer"),
    }
}

/// Routes session events. Owns the heartbeat engine and the receiver table.
pub(crate) struct Dispatcher {
    shared: Arc<SessionShared>,
    receivers: ReceiverTable,
    heartbeat: HeartbeatEngine,
    events: UnboundedReceiver<SessionEvent>,
}

impl Dispatcher {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        receivers: ReceiverTable,
        heartbeat: HeartbeatEngine,
        events: UnboundedReceiver<SessionEvent>,
    ) -> Self {
        Self {
            shared,
            receivers,
            heartbeat,
            events,
        }
    }

    pub(crate) async fn run(mut self) {
        self.heartbeat.start();
        let reason = loop {
            let deadline = self.heartbeat.timeout_deadline();
            let clock = self.heartbeat.clock();
            let timeout = async move {
                match deadline {
                    Some(deadline) => clock.sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };
            let event = tokio::select! {
                biased;
                _ = self.shared.shutdown.cancelled() => break None,
                _ = timeout => {
                    warn!(
                        "heartbeat timed out, last acknowledgement at {:?}",
                        self.heartbeat.last_ack_at()
                    );
                    break Some(DisconnectionReason::TimedOut);
                }
                event = self.events.recv() => event,
            };
            match event {
                Some(SessionEvent::Message(message)) => {
                    if let Err(e) = self.handle_message(message) {
                        break Some(DisconnectionReason::Faulted(Arc::new(e)));
                    }
                }
                Some(SessionEvent::HeartbeatTick) => {
                    if let Some(heartbeat) = self.heartbeat.on_tick() {
                        self.send(&heartbeat);
                    }
                }
                Some(SessionEvent::ReaderClosed) | None => {
                    debug!("server closed the stream");
                    break Some(DisconnectionReason::CompletedNormally);
                }
                Some(SessionEvent::ReaderFailed(e)) => {
                    break Some(DisconnectionReason::Faulted(Arc::new(e)));
                }
            }
        };
        self.heartbeat.stop();
        if let Some(reason) = reason {
            self.shared.disconnect(reason);
        }
    }

    fn handle_message(&mut self, message: ServerMessage) -> Result<()> {
        match message {
            ServerMessage::Response(response) => self.complete_call(response),
            ServerMessage::ErrorResponse { message_id, error } => {
                if !self
                    .shared
                    .pending
                    .resolve(message_id, Err(RpcError::Service(error)))
                {
                    warn!("error response for unknown message id {}", message_id);
                }
            }
            ServerMessage::Broadcast(broadcast) => self.broadcast(broadcast)?,
            ServerMessage::ClientResultRequest(request) => self.client_result(request),
            ServerMessage::ClientHeartbeatAck {
                sequence,
                client_sent_at,
            } => self
                .heartbeat
                .on_client_heartbeat_ack(sequence, client_sent_at),
            ServerMessage::ServerHeartbeat {
                sequence,
                server_sent_at,
                metadata,
            } => {
                if let Some(ack) =
                    self.heartbeat
                        .on_server_heartbeat(sequence, server_sent_at, metadata)
                {
                    self.send(&ack);
                }
            }
        }
        Ok(())
    }

    fn complete_call(&self, response: Response) {
        match self.shared.pending.take(response.message_id) {
            Some(call) if call.method_id == response.method_id => call.resolve(Ok(response.result)),
            Some(call) => {
                let error = ProtocolError::MethodMismatch {
                    message_id: response.message_id,
                    expected: call.method_id,
                    actual: response.method_id,
                };
                warn!("{}", error);
                call.resolve(Err(error.into()));
            }
            None => warn!("response for unknown message id {}", response.message_id),
        }
    }

    fn broadcast(&self, broadcast: Broadcast) -> Result<()> {
        match self.receivers.get(broadcast.method_id) {
            Some(ReceiverMethod::Broadcast(handler)) => {
                if let Err(e) = handler(broadcast.args) {
                    error!(
                        "receiver method {} failed: {}",
                        broadcast.method_id, e
                    );
                }
                Ok(())
            }
            _ => Err(ProtocolError::UnknownMethod(broadcast.method_id).into()),
        }
    }

    fn client_result(&self, request: ClientResultRequest) {
        let ClientResultRequest {
            request_id,
            method_id,
            args,
        } = request;
        let handler = match self.receivers.get(method_id) {
            Some(ReceiverMethod::ClientResult(handler)) => handler.clone(),
            _ => {
                warn!("no client result method registered for method id {}", method_id);
                self.send(&ClientMessage::ClientResult(ClientResultResponse {
                    request_id,
                    method_id,
                    result: Err(ServiceError::new(
                        ServiceError::UNIMPLEMENTED,
                        format!("method id {} is not implemented", method_id),
                    )),
                }));
                return;
            }
        };
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut task = tokio::spawn(handler(args));
            let result = tokio::select! {
                biased;
                _ = shared.shutdown.cancelled() => {
                    task.abort();
                    return;
                }
                joined = &mut task => match joined {
                    Ok(result) => result,
                    Err(e) => {
                        let message = task_failure(e);
                        error!("client result method {} panicked: {}", method_id, message);
                        Err(ServiceError::new(ServiceError::INTERNAL, message))
                    }
                },
            };
            if let Err(e) = &result {
                debug!("client result method {} failed: {}", method_id, e);
            }
            let response = ClientMessage::ClientResult(ClientResultResponse {
                request_id,
                method_id,
                result,
            });
            if let Err(e) = shared.send(&response) {
                debug!("dropping client result for method {}: {}", method_id, e);
            }
        });
    }

    fn send(&self, message: &ClientMessage) {
        if let Err(e) = self.shared.send(message) {
            debug!("dropping outbound frame: {}", e);
        }
    }
}
