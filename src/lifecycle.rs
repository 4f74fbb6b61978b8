//! Session state machine and disconnection reasons.
use std::{fmt, sync::Arc};

use tokio::sync::watch;
use tracing::debug;

use crate::error::RpcError;

/// Why a session ended. Recorded exactly once per session.
#[derive(Debug, Clone)]
pub enum DisconnectionReason {
    /// The session was disposed, or the server closed the stream cleanly.
    CompletedNormally,
    /// No heartbeat acknowledgement arrived within the configured timeout.
    TimedOut,
    /// The transport failed or the peer violated the protocol.
    Faulted(Arc<RpcError>),
}

impl DisconnectionReason {
    /// The error that ended the session, if any.
    pub fn error(&self) -> Option<&RpcError> {
        match self {
            DisconnectionReason::Faulted(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, DisconnectionReason::TimedOut)
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self, DisconnectionReason::Faulted(_))
    }
}

impl fmt::Display for DisconnectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectionReason::CompletedNormally => write!(f, "completed normally"),
            DisconnectionReason::TimedOut => write!(f, "heartbeat timed out"),
            DisconnectionReason::Faulted(error) => write!(f, "faulted: {}", error),
        }
    }
}

/// Connection state as seen by application code. Never returns to `Connected`.
#[derive(Debug, Clone)]
pub enum SessionState {
    Connected,
    Disconnected(DisconnectionReason),
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    pub fn reason(&self) -> Option<&DisconnectionReason> {
        match self {
            SessionState::Connected => None,
            SessionState::Disconnected(reason) => Some(reason),
        }
    }
}

/// Publishes the session state to any number of waiters.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: watch::Sender<SessionState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Connected);
        Self { state }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Records `reason` if the session is still connected. Returns false if a reason was already
    /// recorded, in which case the existing one is kept.
    pub(crate) fn transition(&self, reason: DisconnectionReason) -> bool {
        let changed = self.state.send_if_modified(|state| match state {
            SessionState::Connected => {
                *state = SessionState::Disconnected(reason.clone());
                true
            }
            SessionState::Disconnected(_) => false,
        });
        if changed {
            debug!("session disconnected: {}", reason);
        }
        changed
    }

    /// Resolves with the recorded reason, immediately if the session already ended.
    pub(crate) async fn wait_for_disconnect(&self) -> DisconnectionReason {
        let mut receiver = self.state.subscribe();
        let reason = match receiver.wait_for(|state| !state.is_connected()).await {
            Ok(state) => state
                .reason()
                .cloned()
                .unwrap_or(DisconnectionReason::CompletedNormally),
            // The sender lives as long as `self`, so this cannot be observed.
            Err(_) => DisconnectionReason::CompletedNormally,
        };
        reason
    }
}
