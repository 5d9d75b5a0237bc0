//! Time sources consumed by the scheduler, timer and task collection.
//!
//! A [`TimeSource`] answers "what time is it" and knows how to wait for a
//! span of its own time. Real clocks wait on the Tokio timer; the manual clock
//! wakes its sleepers whenever it is moved.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use futures::future::BoxFuture;
use tokio::sync::Notify;

use crate::time::{TimeSpan, Timestamp};

/// Source of the current time. Must be callable concurrently.
pub trait TimeSource: Send + Sync + 'static {
    fn now(&self) -> Timestamp;

    /// Wait until roughly `span` of this source's time has passed.
    fn sleep(&self, span: TimeSpan) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(span.to_std()))
    }
}

/// Wall clock backed by `chrono::Utc::now`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_datetime(chrono::Utc::now())
    }
}

/// Monotonic clock anchored at the wall-clock time of its creation.
///
/// Reads `tokio::time::Instant`, so a paused Tokio runtime (tests) controls it.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Timestamp,
    anchor: tokio::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::starting_at(SystemClock.now())
    }

    pub fn starting_at(origin: Timestamp) -> Self {
        Self {
            origin,
            anchor: tokio::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn now(&self) -> Timestamp {
        self.origin + TimeSpan::from_std(self.anchor.elapsed())
    }
}

/// Clock that only moves when told to. Sleepers wake once the clock reaches
/// their deadline.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    inner: Arc<ManualInner>,
}

#[derive(Debug, Default)]
struct ManualInner {
    ticks: AtomicI64,
    moved: Notify,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        let clock = Self::default();
        clock.inner.ticks.store(start.ticks(), Ordering::SeqCst);
        clock
    }

    pub fn set(&self, at: Timestamp) {
        self.inner.ticks.store(at.ticks(), Ordering::SeqCst);
        self.inner.moved.notify_waiters();
    }

    pub fn advance(&self, span: TimeSpan) -> Timestamp {
        let at = self.now() + span;
        self.set(at);
        at
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_ticks(self.inner.ticks.load(Ordering::SeqCst))
    }

    fn sleep(&self, span: TimeSpan) -> BoxFuture<'static, ()> {
        let inner = Arc::clone(&self.inner);
        let deadline = self.now() + span;
        Box::pin(async move {
            loop {
                let moved = inner.moved.notified();
                if inner.ticks.load(Ordering::SeqCst) >= deadline.ticks() {
                    return;
                }
                moved.await;
            }
        })
    }
}

/// Shared handle to any time source.
pub type SharedClock = Arc<dyn TimeSource>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_clock_wakes_sleepers() {
        let clock = ManualClock::new(Timestamp::from_ticks(100));
        let sleeper = tokio::spawn(clock.sleep(TimeSpan::from_ticks(50)));

        clock.advance(TimeSpan::from_ticks(20));
        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        clock.advance(TimeSpan::from_ticks(30));
        sleeper.await.unwrap();
        assert_eq!(clock.now(), Timestamp::from_ticks(150));
    }

    #[tokio::test]
    async fn test_manual_clock_zero_sleep_returns() {
        let clock = ManualClock::new(Timestamp::EPOCH);
        clock.sleep(TimeSpan::ZERO).await;
        clock.sleep(TimeSpan::from_ticks(-10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_monotonic_clock_follows_tokio_time() {
        let clock = MonotonicClock::starting_at(Timestamp::from_ticks(0));
        tokio::time::advance(std::time::Duration::from_millis(250)).await;
        assert_eq!(clock.now(), Timestamp::from_ticks(0) + TimeSpan::from_millis(250));
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        let now = SystemClock.now();
        let year_2020 = Timestamp::from_ticks(1_577_836_800 * crate::time::TICKS_PER_SECOND);
        assert!(now > year_2020);
    }
}
