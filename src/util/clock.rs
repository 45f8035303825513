use std::fmt::Debug;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the UNIX epoch. This is the unit of every timestamp that goes over the
///  wire (`lastPingDate`, `createdDate`, ping initiation dates).
pub type Timestamp = i64;

/// Source of wall clock time for a peer.
///
/// Timestamps are compared across peers (a ping's initiation date is echoed back and subtracted
///  from the receipt time on the same host), so this is wall clock time rather than a monotonic
///  instant.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Debug + Send + Sync + 'static {
    fn now_millis(&self) -> Timestamp;
}

#[derive(Debug, Default)]
pub struct SystemClock {}
impl Clock for SystemClock {
    fn now_millis(&self) -> Timestamp {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_millis().try_into().unwrap_or(Timestamp::MAX),
            // system clock before the epoch: report the (negative) offset rather than panicking
            Err(e) => -(e.duration().as_millis() as Timestamp),
        }
    }
}

/// A clock that always returns the same point in time, for tests that compare timestamps
///  across peers.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub Timestamp);
impl Clock for FixedClock {
    fn now_millis(&self) -> Timestamp {
        self.0
    }
}

/// Wall clock time derived from tokio's clock: a fixed base plus the time elapsed since the
///  clock was created. Under a paused tokio runtime this advances exactly with `tokio::time`,
///  which makes timestamps in tests deterministic.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    base: Timestamp,
    started: tokio::time::Instant,
}
impl TokioClock {
    pub fn new(base: Timestamp) -> TokioClock {
        TokioClock {
            base,
            started: tokio::time::Instant::now(),
        }
    }
}
impl Clock for TokioClock {
    fn now_millis(&self) -> Timestamp {
        let elapsed: Timestamp = self.started.elapsed().as_millis().try_into().unwrap_or(Timestamp::MAX);
        self.base.saturating_add(elapsed)
    }
}
