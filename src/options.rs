//! Session configuration.
use std::{fmt, sync::Arc, time::Duration};

use crate::{
    clock::{Clock, TokioClock},
    heartbeat::{ClientHeartbeatEvent, ServerHeartbeatEvent},
};

/// Observer invoked for every heartbeat the server sends.
pub type ServerHeartbeatCallback = Arc<dyn Fn(ServerHeartbeatEvent) + Send + Sync>;
/// Observer invoked for every acknowledgement of a client heartbeat.
pub type ClientHeartbeatCallback = Arc<dyn Fn(ClientHeartbeatEvent) + Send + Sync>;

/// Options for a hub session.
///
/// Client heartbeats and the heartbeat timeout are both disabled by default. Server heartbeats
/// are always acknowledged.
#[derive(Clone)]
pub struct SessionOptions {
    pub(crate) heartbeat_interval: Option<Duration>,
    pub(crate) heartbeat_timeout: Option<Duration>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) on_server_heartbeat: Option<ServerHeartbeatCallback>,
    pub(crate) on_client_heartbeat_ack: Option<ClientHeartbeatCallback>,
    pub(crate) frame_pool_size: usize,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the time between client heartbeats. `None` or a zero interval disables them.
    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval.filter(|interval| !interval.is_zero());
        self
    }

    /// Sets how long the oldest unacknowledged heartbeat may stay unanswered before the session
    /// is declared timed out. `None` disables the timeout.
    pub fn with_heartbeat_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Registers an observer for server heartbeats. It runs on the dispatcher and should not
    /// block.
    pub fn on_server_heartbeat<F>(mut self, callback: F) -> Self
    where
        F: Fn(ServerHeartbeatEvent) + Send + Sync + 'static,
    {
        self.on_server_heartbeat = Some(Arc::new(callback));
        self
    }

    /// Registers an observer for client heartbeat acknowledgements, which carry the measured
    /// round-trip time. It runs on the dispatcher and should not block.
    pub fn on_client_heartbeat_ack<F>(mut self, callback: F) -> Self
    where
        F: Fn(ClientHeartbeatEvent) + Send + Sync + 'static,
    {
        self.on_client_heartbeat_ack = Some(Arc::new(callback));
        self
    }

    /// Sets how many idle frame buffers the session keeps for reuse.
    pub fn with_frame_pool_size(mut self, size: usize) -> Self {
        self.frame_pool_size = size;
        self
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        self.heartbeat_timeout
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: None,
            heartbeat_timeout: None,
            clock: Arc::new(TokioClock),
            on_server_heartbeat: None,
            on_client_heartbeat_ack: None,
            frame_pool_size: 4,
        }
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("clock", &self.clock)
            .field("on_server_heartbeat", &self.on_server_heartbeat.is_some())
            .field("on_client_heartbeat_ack", &self.on_client_heartbeat_ack.is_some())
            .field("frame_pool_size", &self.frame_pool_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_interval_disables_heartbeats() {
        let options = SessionOptions::new().with_heartbeat_interval(Some(Duration::ZERO));
        assert_eq!(options.heartbeat_interval(), None);

        let options = options.with_heartbeat_interval(Some(Duration::from_secs(1)));
        assert_eq!(options.heartbeat_interval(), Some(Duration::from_secs(1)));
    }
}
