//! Clock Abstraction for Backoff Timing
//!
//! The retrying transport sleeps between rate-limited attempts. Production
//! code sleeps on the tokio timer; tests inject `SimulatedClock`, which
//! records every requested sleep and advances virtual time instantly, so
//! backoff arithmetic can be asserted without wall-clock waits.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Source of awaitable sleeps
///
/// Implementations:
/// - `ProductionClock`: tokio timer
/// - `SimulatedClock`: virtual time for deterministic tests
pub trait Clock: Send + Sync + Clone + 'static {
    /// Suspend the calling task for `duration`
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Production clock backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct ProductionClock;

impl ProductionClock {
    pub fn new() -> Self {
        ProductionClock
    }
}

impl Clock for ProductionClock {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Simulated clock for deterministic testing
///
/// Virtual time only advances when a sleep is requested. Clones share the
/// same underlying time and sleep log.
#[derive(Clone, Default)]
pub struct SimulatedClock {
    time_ms: Arc<AtomicU64>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl SimulatedClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every sleep requested so far, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    /// Current virtual time in milliseconds
    pub fn current_ms(&self) -> u64 {
        self.time_ms.load(Ordering::SeqCst)
    }
}

impl Clock for SimulatedClock {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.sleeps.lock().push(duration);
        self.time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_clock_records_sleeps() {
        let clock = SimulatedClock::new();

        clock.sleep(Duration::from_millis(100)).await;
        clock.sleep(Duration::from_millis(200)).await;

        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert_eq!(clock.current_ms(), 300);
    }

    #[tokio::test]
    async fn test_simulated_clock_clones_share_time() {
        let clock = SimulatedClock::new();
        let observer = clock.clone();

        clock.sleep(Duration::from_millis(50)).await;

        assert_eq!(observer.current_ms(), 50);
        assert_eq!(observer.sleeps().len(), 1);
    }

    #[tokio::test]
    async fn test_production_clock_sleeps() {
        let clock = ProductionClock::new();
        let start = std::time::Instant::now();

        clock.sleep(Duration::from_millis(10)).await;

        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
