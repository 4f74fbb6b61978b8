//! Client-side receiver methods the hub can invoke.
use std::{collections::HashMap, fmt, future::Future, pin::Pin, sync::Arc};

use rmpv::Value;

use crate::{
    error::{ProtocolError, Result, ServiceError},
    message::{is_reserved_method_id, MethodId},
};

/// Future returned by a client-result receiver method.
pub type ClientResultFuture =
    Pin<Box<dyn Future<Output = std::result::Result<Value, ServiceError>> + Send>>;

type BroadcastFn = Arc<dyn Fn(Value) -> Result<()> + Send + Sync>;
type ClientResultFn = Arc<dyn Fn(Value) -> ClientResultFuture + Send + Sync>;

#[derive(Clone)]
pub(crate) enum ReceiverMethod {
    /// Invoked inline on the dispatcher for every broadcast frame.
    Broadcast(BroadcastFn),
    /// Spawned as its own task; its result is written back to the hub.
    ClientResult(ClientResultFn),
}

/// A method-id indexed table of receiver methods, built once before the session starts.
///
/// Broadcast handlers run on the session's dispatcher, in frame order, and should return quickly.
/// A handler error is logged and does not end the session. Client-result handlers run on their
/// own tasks.
///
/// ```
/// use mhub::{ReceiverTable, ServiceError, Value};
///
/// let receivers = ReceiverTable::new()
///     .on_broadcast(1, |args| {
///         println!("joined: {}", args);
///         Ok(())
///     })
///     .on_client_result(2, |args| async move {
///         args.as_i64()
///             .map(|n| Value::from(n * 2))
///             .ok_or_else(|| ServiceError::new(ServiceError::INTERNAL, "expected an integer"))
///     });
/// ```
#[derive(Clone, Default)]
pub struct ReceiverTable {
    methods: HashMap<MethodId, ReceiverMethod>,
}

impl ReceiverTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for broadcasts to `method_id`, replacing any earlier registration.
    pub fn on_broadcast<F>(mut self, method_id: MethodId, handler: F) -> Self
    where
        F: Fn(Value) -> Result<()> + Send + Sync + 'static,
    {
        self.methods
            .insert(method_id, ReceiverMethod::Broadcast(Arc::new(handler)));
        self
    }

    /// Registers a handler for client-result requests to `method_id`, replacing any earlier
    /// registration.
    pub fn on_client_result<F, Fut>(mut self, method_id: MethodId, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, ServiceError>> + Send + 'static,
    {
        let boxed: ClientResultFn =
            Arc::new(move |args: Value| -> ClientResultFuture { Box::pin(handler(args)) });
        self.methods
            .insert(method_id, ReceiverMethod::ClientResult(boxed));
        self
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub(crate) fn get(&self, method_id: MethodId) -> Option<&ReceiverMethod> {
        self.methods.get(&method_id)
    }

    /// Fails if any registered method id collides with a heartbeat tag.
    pub(crate) fn validate(&self) -> Result<()> {
        let mut ids: Vec<_> = self.methods.keys().copied().collect();
        ids.sort_unstable();
        match ids.into_iter().find(|id| is_reserved_method_id(*id)) {
            Some(id) => Err(ProtocolError::ReservedMethodId(id).into()),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ReceiverTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.methods.keys().collect();
        ids.sort_unstable();
        f.debug_struct("ReceiverTable").field("methods", &ids).finish()
    }
}
