//! Heartbeat timing, driven by a paused tokio clock.
mod common;

use std::{
    sync::Arc,
    time::{Duration, UNIX_EPOCH},
};

use async_trait::async_trait;
use mhub::{
    ClientHeartbeatEvent, ClientMessage, Clock, DisconnectionReason, ReceiverTable, RpcError,
    ServerHeartbeatEvent, ServerMessage, SessionOptions, Value,
};
use tokio::{
    sync::{mpsc, watch},
    time::{advance, timeout, Instant},
};

/// A clock that only moves when the test advances it.
#[derive(Debug)]
struct ManualClock {
    now: watch::Sender<Instant>,
}

impl ManualClock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            now: watch::Sender::new(Instant::now()),
        })
    }

    fn advance(&self, by: Duration) {
        self.now.send_modify(|now| *now += by);
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.borrow()
    }

    async fn sleep_until(&self, deadline: Instant) {
        let mut now = self.now.subscribe();
        let _ = now.wait_for(|now| *now >= deadline).await;
    }
}

fn options(interval_ms: u64, timeout_ms: Option<u64>) -> SessionOptions {
    SessionOptions::new()
        .with_heartbeat_interval(Some(Duration::from_millis(interval_ms)))
        .with_heartbeat_timeout(timeout_ms.map(Duration::from_millis))
}

async fn expect_heartbeat(hub: &mut common::TestHub) -> (i16, i64) {
    match hub.recv().await {
        Some(ClientMessage::ClientHeartbeat {
            sequence,
            client_sent_at,
        }) => (sequence, client_sent_at),
        other => panic!("expected client heartbeat, got {:?}", other),
    }
}

fn ack(sequence: i16, client_sent_at: i64) -> ServerMessage {
    ServerMessage::ClientHeartbeatAck {
        sequence,
        client_sent_at,
    }
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_follow_interval() {
    let (session, mut hub) = common::connect(ReceiverTable::new(), options(1000, None)).await;
    let start = Instant::now();

    let mut sent = Vec::new();
    for _ in 0..3 {
        sent.push(expect_heartbeat(&mut hub).await);
    }
    assert_eq!(sent, vec![(0, 1000), (1, 2000), (2, 3000)]);
    assert_eq!(start.elapsed(), Duration::from_secs(3));

    // Nothing else is due until the next interval.
    assert!(timeout(Duration::from_millis(500), hub.recv()).await.is_err());
    session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_disabled_heartbeats_send_nothing() {
    let (session, mut hub) = common::connect(ReceiverTable::new(), SessionOptions::new()).await;
    assert!(timeout(Duration::from_secs(10), hub.recv()).await.is_err());
    assert!(session.state().is_connected());
    session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_round_trip_time_is_measured_from_send() {
    let (tx, mut rx) = mpsc::unbounded_channel::<ClientHeartbeatEvent>();
    let options = options(1000, None).on_client_heartbeat_ack(move |event| {
        tx.send(event).unwrap();
    });
    let (session, mut hub) = common::connect(ReceiverTable::new(), options).await;

    let (sequence, sent_at) = expect_heartbeat(&mut hub).await;
    advance(Duration::from_millis(100)).await;
    hub.send(ack(sequence, sent_at)).await;

    let event = rx.recv().await.unwrap();
    assert_eq!(event.sequence, 0);
    assert_eq!(event.round_trip_time, Duration::from_millis(100));
    session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_missing_ack_times_out() {
    let (session, mut hub) = common::connect(ReceiverTable::new(), options(1000, Some(500))).await;
    let start = Instant::now();

    expect_heartbeat(&mut hub).await;
    advance(Duration::from_millis(499)).await;
    tokio::task::yield_now().await;
    assert!(session.state().is_connected());

    let reason = session.wait_for_disconnect().await;
    assert!(reason.is_timed_out());
    assert_eq!(start.elapsed(), Duration::from_millis(1500));
    assert!(matches!(
        session.call(1, Value::Nil).await,
        Err(RpcError::Disconnected {
            reason: DisconnectionReason::TimedOut
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_timely_acks_prevent_timeout() {
    let (session, mut hub) = common::connect(ReceiverTable::new(), options(1000, Some(500))).await;

    for expected in 0..5 {
        let (sequence, sent_at) = expect_heartbeat(&mut hub).await;
        assert_eq!(sequence, expected);
        advance(Duration::from_millis(100)).await;
        hub.send(ack(sequence, sent_at)).await;
    }
    advance(Duration::from_millis(300)).await;
    tokio::task::yield_now().await;
    assert!(session.state().is_connected());
    session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_oldest_unacked_heartbeat_times_out() {
    let (session, mut hub) = common::connect(ReceiverTable::new(), options(1000, Some(3000))).await;
    let start = Instant::now();

    let mut sent = Vec::new();
    for _ in 0..3 {
        sent.push(expect_heartbeat(&mut hub).await);
    }
    // Three heartbeats outstanding is within the window.
    assert!(session.state().is_connected());

    // Acknowledging the newer ones does not save the oldest.
    for &(sequence, sent_at) in &sent[1..] {
        hub.send(ack(sequence, sent_at)).await;
    }
    let reason = session.wait_for_disconnect().await;
    assert!(reason.is_timed_out());
    assert_eq!(start.elapsed(), Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn test_late_acks_move_window_to_next_oldest() {
    let (session, mut hub) = common::connect(ReceiverTable::new(), options(1000, Some(3000))).await;
    let start = Instant::now();

    let mut sent = Vec::new();
    for _ in 0..3 {
        sent.push(expect_heartbeat(&mut hub).await);
    }
    advance(Duration::from_millis(500)).await;
    for &(sequence, sent_at) in &sent[..2] {
        hub.send(ack(sequence, sent_at)).await;
    }

    // Heartbeat 2 was sent at 3s and is now the oldest outstanding one.
    let reason = session.wait_for_disconnect().await;
    assert!(reason.is_timed_out());
    assert_eq!(start.elapsed(), Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_server_heartbeat_is_echoed_once() {
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerHeartbeatEvent>();
    let options = SessionOptions::new().on_server_heartbeat(move |event| {
        tx.send(event).unwrap();
    });
    let (session, mut hub) = common::connect(ReceiverTable::new(), options).await;

    let metadata = Value::Binary(vec![1, 2, 3]);
    hub.send(ServerMessage::ServerHeartbeat {
        sequence: 5,
        server_sent_at: 1_700_000_000_250,
        metadata: metadata.clone(),
    })
    .await;

    assert_eq!(
        hub.recv().await,
        Some(ClientMessage::ServerHeartbeatAck {
            sequence: 5,
            server_sent_at: 1_700_000_000_250,
        })
    );
    let event = rx.recv().await.unwrap();
    assert_eq!(event.sequence, 5);
    assert_eq!(event.metadata, metadata);
    assert_eq!(
        event.server_time(),
        UNIX_EPOCH + Duration::from_millis(1_700_000_000_250)
    );

    assert!(timeout(Duration::from_secs(1), hub.recv()).await.is_err());
    session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_server_heartbeat_does_not_reset_timeout() {
    let (session, mut hub) = common::connect(ReceiverTable::new(), options(1000, Some(500))).await;
    let start = Instant::now();

    expect_heartbeat(&mut hub).await;
    advance(Duration::from_millis(200)).await;
    hub.send(ServerMessage::ServerHeartbeat {
        sequence: 0,
        server_sent_at: 0,
        metadata: Value::Nil,
    })
    .await;
    assert!(matches!(
        hub.recv().await,
        Some(ClientMessage::ServerHeartbeatAck { sequence: 0, .. })
    ));

    let reason = session.wait_for_disconnect().await;
    assert!(reason.is_timed_out());
    assert_eq!(start.elapsed(), Duration::from_millis(1500));
}

#[tokio::test(start_paused = true)]
async fn test_injected_clock_drives_ticks_and_timeout() {
    let clock = ManualClock::new();
    let options = options(1000, Some(500)).with_clock(clock.clone());
    let (session, mut hub) = common::connect(ReceiverTable::new(), options).await;

    // Tokio time passing does not move the session's clock.
    assert!(timeout(Duration::from_secs(10), hub.recv()).await.is_err());
    assert!(session.state().is_connected());

    clock.advance(Duration::from_secs(1));
    assert_eq!(expect_heartbeat(&mut hub).await, (0, 1000));

    clock.advance(Duration::from_millis(499));
    assert!(timeout(Duration::from_secs(10), session.wait_for_disconnect())
        .await
        .is_err());

    clock.advance(Duration::from_millis(1));
    let reason = timeout(Duration::from_secs(10), session.wait_for_disconnect())
        .await
        .unwrap();
    assert!(reason.is_timed_out());
}

#[tokio::test(start_paused = true)]
async fn test_injected_clock_measures_round_trip_time() {
    let clock = ManualClock::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<ClientHeartbeatEvent>();
    let options = options(1000, None)
        .with_clock(clock.clone())
        .on_client_heartbeat_ack(move |event| {
            tx.send(event).unwrap();
        });
    let (session, mut hub) = common::connect(ReceiverTable::new(), options).await;

    clock.advance(Duration::from_secs(1));
    let (sequence, sent_at) = expect_heartbeat(&mut hub).await;
    advance(Duration::from_secs(5)).await;
    clock.advance(Duration::from_millis(30));
    hub.send(ack(sequence, sent_at)).await;

    let event = rx.recv().await.unwrap();
    assert_eq!(event.round_trip_time, Duration::from_millis(30));
    session.dispose().await;
}

#[tokio::test]
async fn test_panicking_heartbeat_observer_faults_session() {
    let options = SessionOptions::new().on_server_heartbeat(|_| panic!("observer bug"));
    let (session, mut hub) = common::connect(ReceiverTable::new(), options).await;

    hub.send(ServerMessage::ServerHeartbeat {
        sequence: 1,
        server_sent_at: 0,
        metadata: Value::Nil,
    })
    .await;

    let reason = session.wait_for_disconnect().await;
    assert!(matches!(
        reason.error(),
        Some(RpcError::Panicked(message)) if message.contains("observer bug")
    ));
    session.dispose().await;
}
