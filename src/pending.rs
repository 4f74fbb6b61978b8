//! Correlation of in-flight calls with their responses.
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use rmpv::Value;
use tokio::sync::oneshot;
use tracing::trace;

use crate::{
    error::{ProtocolError, Result, RpcError},
    lifecycle::DisconnectionReason,
    message::{MessageId, MethodId},
};

/// A call awaiting its response.
#[derive(Debug)]
pub(crate) struct PendingCall {
    /// Method the call was issued against, used to validate the response.
    pub(crate) method_id: MethodId,
    sender: oneshot::Sender<Result<Value>>,
}

impl PendingCall {
    /// Completes the call. The caller may have stopped waiting, which is not an error.
    pub(crate) fn resolve(self, result: Result<Value>) {
        drop(self.sender.send(result));
    }
}

#[derive(Debug, Default)]
struct Inner {
    calls: HashMap<MessageId, PendingCall>,
    /// Set once the table is drained. Registration fails from then on.
    closed: Option<DisconnectionReason>,
}

/// Maps message ids to single-assignment completion slots.
///
/// Registration happens on arbitrary caller tasks, resolution on the dispatcher. Both go through
/// one lock, so a call can never be registered after the table was drained.
#[derive(Debug, Default)]
pub(crate) struct PendingCallTable {
    inner: Mutex<Inner>,
}

impl PendingCallTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a call under `message_id` and returns the receiving end of its slot.
    pub(crate) fn register(
        &self,
        message_id: MessageId,
        method_id: MethodId,
    ) -> Result<oneshot::Receiver<Result<Value>>> {
        let mut inner = self.lock();
        if let Some(reason) = &inner.closed {
            return Err(RpcError::Disconnected {
                reason: reason.clone(),
            });
        }
        if inner.calls.contains_key(&message_id) {
            return Err(ProtocolError::DuplicateMessageId(message_id).into());
        }
        let (sender, receiver) = oneshot::channel();
        inner
            .calls
            .insert(message_id, PendingCall { method_id, sender });
        Ok(receiver)
    }

    /// Removes and returns the call registered under `message_id`, if it is still pending.
    pub(crate) fn take(&self, message_id: MessageId) -> Option<PendingCall> {
        self.lock().calls.remove(&message_id)
    }

    /// Completes the call registered under `message_id`. Unknown ids are ignored: the call may
    /// have been cancelled or the table drained.
    pub(crate) fn resolve(&self, message_id: MessageId, result: Result<Value>) -> bool {
        match self.take(message_id) {
            Some(call) => {
                call.resolve(result);
                true
            }
            None => {
                trace!("no pending call for message id {}", message_id);
                false
            }
        }
    }

    /// Fails every pending call with an error carrying `reason`, and refuses later registrations.
    pub(crate) fn drain_all(&self, reason: &DisconnectionReason) -> usize {
        let calls = {
            let mut inner = self.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason.clone());
            }
            std::mem::take(&mut inner.calls)
        };
        let drained = calls.len();
        for (_, call) in calls {
            call.resolve(Err(RpcError::Disconnected {
                reason: reason.clone(),
            }));
        }
        drained
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().calls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_completes_and_removes() {
        let table = PendingCallTable::new();
        let receiver = table.register(1, 10).unwrap();
        assert_eq!(table.len(), 1);

        assert!(table.resolve(1, Ok(Value::from(42))));
        assert_eq!(table.len(), 0);
        assert_eq!(receiver.await.unwrap().unwrap(), Value::from(42));

        // Second resolution of the same id is a no-op.
        assert!(!table.resolve(1, Ok(Value::Nil)));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let table = PendingCallTable::new();
        let _receiver = table.register(7, 1).unwrap();
        assert!(matches!(
            table.register(7, 1),
            Err(RpcError::Protocol(ProtocolError::DuplicateMessageId(7)))
        ));
    }

    #[tokio::test]
    async fn test_drain_fails_pending_and_closes_table() {
        let table = PendingCallTable::new();
        let first = table.register(1, 1).unwrap();
        let second = table.register(2, 1).unwrap();

        assert_eq!(table.drain_all(&DisconnectionReason::TimedOut), 2);
        for receiver in [first, second] {
            match receiver.await.unwrap() {
                Err(RpcError::Disconnected { reason }) => assert!(reason.is_timed_out()),
                other => panic!("expected disconnected error, got {:?}", other),
            }
        }

        match table.register(3, 1) {
            Err(RpcError::Disconnected { reason }) => assert!(reason.is_timed_out()),
            other => panic!("expected disconnected error, got {:?}", other),
        }
    }
}
