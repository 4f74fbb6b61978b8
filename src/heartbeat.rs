//! Client and server heartbeats.
//!
//! The engine is plain state owned by the session dispatcher: timer ticks and inbound heartbeat
//! frames both reach it through the dispatcher's event queue, so it needs no locking of its own.
use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rmpv::Value;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{
    clock::Clock,
    message::{ClientMessage, Sequence},
    options::{ClientHeartbeatCallback, ServerHeartbeatCallback, SessionOptions},
};

/// Most unacknowledged heartbeats remembered while no timeout is set. Past this the oldest is
/// forgotten, and its acknowledgement falls back to the echoed send time.
const MAX_UNTIMED_IN_FLIGHT: usize = 64;

/// A heartbeat sent by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerHeartbeatEvent {
    pub sequence: Sequence,
    /// Unix time in milliseconds at which the server sent the heartbeat.
    pub server_sent_at: i64,
    /// Opaque metadata attached by the server, `Nil` if it attached none.
    pub metadata: Value,
}

impl ServerHeartbeatEvent {
    /// The server's send time as a `SystemTime`.
    pub fn server_time(&self) -> SystemTime {
        let offset = Duration::from_millis(self.server_sent_at.unsigned_abs());
        let time = if self.server_sent_at >= 0 {
            UNIX_EPOCH.checked_add(offset)
        } else {
            UNIX_EPOCH.checked_sub(offset)
        };
        time.unwrap_or(UNIX_EPOCH)
    }
}

/// The server acknowledged a client heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHeartbeatEvent {
    pub sequence: Sequence,
    pub round_trip_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartbeatStatus {
    Idle,
    Running,
    Stopped,
}

pub(crate) struct HeartbeatEngine {
    status: HeartbeatStatus,
    interval: Option<Duration>,
    timeout: Option<Duration>,
    clock: Arc<dyn Clock>,
    origin: Instant,
    next_sequence: Sequence,
    /// Unacknowledged heartbeats in send order.
    in_flight: VecDeque<(Sequence, Instant)>,
    last_ack_at: Option<Instant>,
    on_server_heartbeat: Option<ServerHeartbeatCallback>,
    on_client_heartbeat_ack: Option<ClientHeartbeatCallback>,
}

impl HeartbeatEngine {
    pub(crate) fn new(options: &SessionOptions) -> Self {
        let clock = options.clock.clone();
        Self {
            status: HeartbeatStatus::Idle,
            interval: options.heartbeat_interval,
            timeout: options.heartbeat_timeout,
            origin: clock.now(),
            clock,
            next_sequence: 0,
            in_flight: VecDeque::new(),
            last_ack_at: None,
            on_server_heartbeat: options.on_server_heartbeat.clone(),
            on_client_heartbeat_ack: options.on_client_heartbeat_ack.clone(),
        }
    }

    /// The interval between client heartbeats, if they are enabled.
    pub(crate) fn interval(&self) -> Option<Duration> {
        self.interval
    }

    #[cfg(test)]
    pub(crate) fn status(&self) -> HeartbeatStatus {
        self.status
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub(crate) fn last_ack_at(&self) -> Option<Instant> {
        self.last_ack_at
    }

    /// Starts the client heartbeat loop. Does nothing if client heartbeats are disabled.
    pub(crate) fn start(&mut self) {
        if self.status == HeartbeatStatus::Idle && self.interval.is_some() {
            self.status = HeartbeatStatus::Running;
        }
    }

    pub(crate) fn stop(&mut self) {
        self.status = HeartbeatStatus::Stopped;
        self.in_flight.clear();
    }

    /// Allocates the next sequence and returns the heartbeat to send.
    pub(crate) fn on_tick(&mut self) -> Option<ClientMessage> {
        if self.status != HeartbeatStatus::Running {
            return None;
        }
        let now = self.clock.now();
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        if self.timeout.is_none() && self.in_flight.len() >= MAX_UNTIMED_IN_FLIGHT {
            self.in_flight.pop_front();
        }
        self.in_flight.push_back((sequence, now));
        trace!("sending client heartbeat {}", sequence);
        Some(ClientMessage::ClientHeartbeat {
            sequence,
            client_sent_at: self.elapsed_millis(now),
        })
    }

    /// Records an acknowledgement and notifies the observer with the round-trip time.
    pub(crate) fn on_client_heartbeat_ack(&mut self, sequence: Sequence, client_sent_at: i64) {
        if self.status == HeartbeatStatus::Stopped {
            return;
        }
        let now = self.clock.now();
        let round_trip_time = match self.in_flight.iter().position(|(s, _)| *s == sequence) {
            Some(index) => {
                let (_, sent_at) = self.in_flight.remove(index).unwrap_or((sequence, now));
                now.saturating_duration_since(sent_at)
            }
            None => {
                // Unknown sequence: fall back to the time the server echoed.
                let elapsed = self.elapsed_millis(now).saturating_sub(client_sent_at);
                Duration::from_millis(elapsed.max(0) as u64)
            }
        };
        self.last_ack_at = Some(now);
        debug!(
            "client heartbeat {} acknowledged, rtt={:?}",
            sequence, round_trip_time
        );
        if let Some(callback) = &self.on_client_heartbeat_ack {
            callback(ClientHeartbeatEvent {
                sequence,
                round_trip_time,
            });
        }
    }

    /// Notifies the observer and returns the acknowledgement to send back.
    pub(crate) fn on_server_heartbeat(
        &mut self,
        sequence: Sequence,
        server_sent_at: i64,
        metadata: Value,
    ) -> Option<ClientMessage> {
        if self.status == HeartbeatStatus::Stopped {
            return None;
        }
        trace!("server heartbeat {} received", sequence);
        if let Some(callback) = &self.on_server_heartbeat {
            callback(ServerHeartbeatEvent {
                sequence,
                server_sent_at,
                metadata,
            });
        }
        Some(ClientMessage::ServerHeartbeatAck {
            sequence,
            server_sent_at,
        })
    }

    /// When the oldest unacknowledged heartbeat runs out of time. `None` while nothing is
    /// outstanding or the timeout is disabled.
    pub(crate) fn timeout_deadline(&self) -> Option<Instant> {
        if self.status != HeartbeatStatus::Running {
            return None;
        }
        let timeout = self.timeout?;
        let (_, oldest) = self.in_flight.front()?;
        Some(*oldest + timeout)
    }

    fn elapsed_millis(&self, at: Instant) -> i64 {
        at.saturating_duration_since(self.origin).as_millis() as i64
    }
}
