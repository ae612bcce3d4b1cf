//! Clock abstraction, ported from `spark-core::time::clock`.
//!
//! Production code runs on [`SystemClock`] (backed by `tokio::time`);
//! tests use [`MockClock`] to drive retry/backoff and window-alignment
//! logic deterministically.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration) -> Sleep;
}

/// The real clock. `now()` is `Instant::now()`; `sleep` delegates to
/// `tokio::time::sleep` so it participates in `tokio::time::pause()` in
/// tests that want real scheduling without real wall-clock delays.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// A manually-advanced clock for deterministic tests. `sleep` resolves
/// immediately; elapsed time is simulated by calling [`MockClock::advance`].
#[derive(Clone)]
pub struct MockClock {
    base: Instant,
    offset_millis: Arc<AtomicU64>,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_millis: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.offset_millis
            .fetch_add(duration.as_millis() as u64, Ordering::AcqRel);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_millis.load(Ordering::Acquire))
    }

    fn sleep(&self, _duration: Duration) -> Sleep {
        Box::pin(std::future::ready(()))
    }
}
