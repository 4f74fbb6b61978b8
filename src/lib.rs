//! Multiplexed MessagePack hub sessions over a single duplex stream.
//!
//! A [`Session`] carries many concurrent hub calls, fire-and-forget invocations, server
//! broadcasts and a two-way heartbeat protocol on one ordered byte stream. Responses are matched
//! to calls by message id regardless of arrival order, a silent peer is detected through client
//! heartbeats with round-trip measurement, and every pending call is failed with the
//! disconnection reason when the session ends.
//!
//! To open a session:
//! 1. Build a [`ReceiverTable`] with handlers for the broadcasts and client-result requests the
//!    hub may send
//! 2. Configure heartbeats with [`SessionOptions`]
//! 3. Call `Session::connect_tcp(addr)`, `Session::connect_unix(path)`, or `Session::connect`
//!    with any [`Transport`]
//! 4. Use `session.call()` or `session.fire_and_forget()`, and `session.dispose()` when done
//!
//! ```no_run
//! use std::time::Duration;
//! use mhub::{ReceiverTable, Session, SessionOptions, Value};
//!
//! # async fn run() -> mhub::Result<()> {
//! let receivers = ReceiverTable::new().on_broadcast(1, |args| {
//!     println!("message: {}", args);
//!     Ok(())
//! });
//! let options = SessionOptions::new()
//!     .with_heartbeat_interval(Some(Duration::from_secs(5)))
//!     .with_heartbeat_timeout(Some(Duration::from_secs(15)));
//! let session = Session::connect_tcp("127.0.0.1:5000", receivers, options).await?;
//!
//! let joined = session.call(10, Value::Array(vec!["room".into(), "alice".into()])).await?;
//! println!("joined: {}", joined);
//! session.fire_and_forget(11, Value::from("hello"))?;
//! session.dispose().await;
//! # Ok(())
//! # }
//! ```
//!
//! Uses `tokio` for async I/O and `rmpv` for MessagePack serialization.

mod clock;
mod dispatcher;
mod error;
mod heartbeat;
mod lifecycle;
mod message;
mod options;
mod pending;
mod pool;
mod receiver;
mod session;
mod transport;

pub use clock::*;
pub use error::*;
pub use heartbeat::{ClientHeartbeatEvent, ServerHeartbeatEvent};
pub use lifecycle::{DisconnectionReason, SessionState};
pub use message::*;
pub use options::*;
pub use pool::*;
pub use receiver::{ClientResultFuture, ReceiverTable};
pub use session::*;
pub use transport::*;

pub use rmpv::Value;
pub use tokio_util::sync::CancellationToken;
