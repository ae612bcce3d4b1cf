//! Retry policy and controller. The jitter mixing is ported from
//! `spark-core::governance::retry::adaptive`'s `SplitMix64`-style mixer; the
//! delay strategies themselves (fixed/linear/exponential) are new, since the
//! teacher's `adaptive.rs` computes a single backlog/RTT-driven backoff
//! rather than exposing a strategy enum.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay_core::cancel::Cancellation;
use relay_core::error::{RelayError, RelayErrorKind, RelayResult};
use relay_core::time::Clock;

/// Mirrors `adaptive.rs`'s jitter range: backoff values are perturbed by at
/// most +/-5% so that many callers retrying in lockstep don't stay
/// synchronized (thundering herd).
const JITTER_RANGE: f64 = 0.05;

/// SplitMix64 finalizer, used only to turn an incrementing counter into a
/// well-distributed pseudorandom value — not for anything security-sensitive.
fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^= x >> 31;
    x
}

fn jitter_factor(seed: u64, range: f64) -> f64 {
    let mixed = mix64(seed);
    let unit = (mixed >> 11) as f64 / (1u64 << 53) as f64;
    1.0 + (unit * 2.0 - 1.0) * range
}

#[derive(Clone, Copy, Debug)]
pub enum DelayStrategy {
    Fixed(Duration),
    Linear {
        base: Duration,
        increment: Duration,
    },
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl Default for DelayStrategy {
    fn default() -> Self {
        DelayStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(5),
        }
    }
}

/// Attempts are 1-based: the first try is attempt 1, not 0.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay_strategy: DelayStrategy,
    pub should_retry: Arc<dyn Fn(&RelayError) -> bool + Send + Sync>,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, delay_strategy: DelayStrategy) -> Self {
        Self {
            max_attempts,
            delay_strategy,
            should_retry: Arc::new(|err: &RelayError| !err.kind().is_definitively_non_retriable()),
        }
    }

    pub fn with_should_retry(
        mut self,
        predicate: impl Fn(&RelayError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Arc::new(predicate);
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, DelayStrategy::default())
    }
}

/// Waits for `duration` (per `clock`), checking `cancellation` at a fixed
/// poll interval so a cancellation raised mid-backoff is honored promptly
/// rather than after the full delay elapses.
async fn cancellable_sleep(clock: &dyn Clock, duration: Duration, cancellation: &Cancellation) {
    const POLL_INTERVAL: Duration = Duration::from_millis(20);
    let deadline = clock.now() + duration;
    loop {
        if cancellation.is_cancelled() {
            return;
        }
        let now = clock.now();
        if now >= deadline {
            return;
        }
        let remaining = deadline - now;
        clock.sleep(remaining.min(POLL_INTERVAL)).await;
    }
}

/// Drives a fallible, retryable operation according to a [`RetryPolicy`].
pub struct RetryController {
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    nonce: AtomicU64,
}

impl RetryController {
    pub fn new(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            nonce: AtomicU64::new(0),
        }
    }

    fn raw_delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1) as u32;
        match self.policy.delay_strategy {
            DelayStrategy::Fixed(delay) => delay,
            DelayStrategy::Linear { base, increment } => base + increment * exponent,
            DelayStrategy::Exponential {
                base,
                multiplier,
                max,
            } => {
                let scaled = base.as_secs_f64() * multiplier.powi(exponent as i32);
                Duration::from_secs_f64(scaled.min(max.as_secs_f64()).max(0.0))
            }
        }
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let raw = self.raw_delay_for_attempt(attempt);
        let seed = self.nonce.fetch_add(1, Ordering::Relaxed)
            ^ (attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let factor = jitter_factor(seed, JITTER_RANGE);
        Duration::from_secs_f64((raw.as_secs_f64() * factor).max(0.0))
    }

    /// Runs `op` until it succeeds, `should_retry` says to give up, attempts
    /// are exhausted, or cancellation fires. `op` receives the 1-based
    /// attempt number. A cancelled attempt is never retried (P-cancel).
    pub async fn run<F, Fut, T>(&self, cancellation: &Cancellation, mut op: F) -> RelayResult<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = RelayResult<T>>,
    {
        let mut attempt = 1usize;
        loop {
            if cancellation.is_cancelled() {
                return Err(RelayError::cancelled("cancelled before attempt"));
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    let exhausted = attempt >= self.policy.max_attempts;
                    let retriable = (self.policy.should_retry)(&err);
                    if exhausted || !retriable {
                        return if exhausted && retriable {
                            Err(RelayError::new(RelayErrorKind::RetryExhausted(attempt)))
                        } else {
                            Err(err)
                        };
                    }
                    let delay = self.delay_for_attempt(attempt);
                    cancellable_sleep(self.clock.as_ref(), delay, cancellation).await;
                    if cancellation.is_cancelled() {
                        return Err(RelayError::cancelled("cancelled during backoff"));
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::time::SystemClock;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn retries_until_success_within_max_attempts() {
        let policy = RetryPolicy::new(5, DelayStrategy::Fixed(Duration::from_millis(1)));
        let controller = RetryController::new(policy, Arc::new(SystemClock));
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let cancellation = Cancellation::new();

        let result = controller
            .run(&cancellation, move |attempt| {
                let attempts_clone = Arc::clone(&attempts_clone);
                async move {
                    attempts_clone.fetch_add(1, Ordering::Relaxed);
                    if attempt < 3 {
                        Err(RelayError::execution_failed("not yet"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 3);
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn exhausting_attempts_surfaces_retry_exhausted() {
        let policy = RetryPolicy::new(2, DelayStrategy::Fixed(Duration::from_millis(1)));
        let controller = RetryController::new(policy, Arc::new(SystemClock));
        let cancellation = Cancellation::new();

        let err = controller
            .run(&cancellation, |_attempt| async {
                Err::<(), RelayError>(RelayError::execution_failed("always fails"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), RelayErrorKind::RetryExhausted(2)));
    }

    #[tokio::test]
    async fn cancellation_is_never_retried() {
        let policy = RetryPolicy::new(5, DelayStrategy::Fixed(Duration::from_millis(1)));
        let controller = RetryController::new(policy, Arc::new(SystemClock));
        let cancellation = Cancellation::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let err = controller
            .run(&cancellation, move |_attempt| {
                attempts_clone.fetch_add(1, Ordering::Relaxed);
                async { Err::<(), RelayError>(RelayError::cancelled("stop")) }
            })
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }
}
