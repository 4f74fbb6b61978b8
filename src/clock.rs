//! Time source and timer used for heartbeats.
use std::fmt;

use async_trait::async_trait;
use tokio::time::Instant;

/// A monotonic time source that can also wait for a point in time.
///
/// Everything heartbeat related runs on the session's clock: send times, round-trip times, the
/// heartbeat ticker and the timeout deadline. A test can inject a clock it advances by hand.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    fn now(&self) -> Instant;

    /// Resolves once `now()` has reached `deadline`.
    async fn sleep_until(&self, deadline: Instant);
}

/// The default clock, backed by `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_tokio_time() {
        let clock = TokioClock;
        let start = clock.now();
        clock.sleep_until(start + Duration::from_millis(250)).await;
        assert_eq!(clock.now() - start, Duration::from_millis(250));
    }
}
