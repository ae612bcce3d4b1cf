//! Admission control: a counted semaphore with FIFO waiters and pluggable
//! back-pressure strategies (§4.2).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::error::{RelayError, RelayErrorKind};

/// What happens to a caller that cannot be admitted immediately.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackpressureStrategy {
    /// Queue and wait for a permit (the default).
    Suspend,
    /// Evict the longest-waiting queued caller (with [`RelayErrorKind::Rejected`])
    /// to make room for the new one.
    DropOldest,
    /// Reject the new caller outright rather than queue it.
    DropNewest,
    /// Equivalent to `DropNewest` at the entry point: never queue at all.
    Reject,
}

#[derive(Clone, Debug)]
pub struct SemaphoreConfig {
    pub capacity: usize,
    pub strategy: BackpressureStrategy,
    /// Bounds pending + active admissions. `None` means unbounded.
    pub max_outstanding: Option<usize>,
    /// Bounds the sum of declared sample sizes of queued (not yet admitted)
    /// callers. `None` means unbounded.
    pub max_queue_memory: Option<u64>,
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            strategy: BackpressureStrategy::Suspend,
            max_outstanding: None,
            max_queue_memory: None,
        }
    }
}

struct Waiter {
    id: u64,
    memory: u64,
    notify: Arc<Notify>,
    rejected: Arc<AtomicBool>,
}

struct State {
    active: usize,
    waiters: VecDeque<Waiter>,
    queue_memory: u64,
}

struct Inner {
    config: SemaphoreConfig,
    state: Mutex<State>,
    next_id: AtomicU64,
}

enum Admission {
    Granted,
    Rejected,
    Queued(Arc<Notify>, Arc<AtomicBool>, u64),
}

/// An async, FIFO-fair admission gate. Clone is cheap (shares the same
/// underlying state via `Arc`).
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<Inner>,
}

impl Semaphore {
    pub fn new(config: SemaphoreConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State {
                    active: 0,
                    waiters: VecDeque::new(),
                    queue_memory: 0,
                }),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub async fn acquire(&self) -> Result<Token, RelayError> {
        self.acquire_sized(0).await
    }

    pub async fn acquire_sized(&self, memory: u64) -> Result<Token, RelayError> {
        match self.admit_or_enqueue(memory) {
            Admission::Granted => Ok(self.make_token()),
            Admission::Rejected => Err(RelayError::new(RelayErrorKind::Rejected)),
            Admission::Queued(notify, rejected, _id) => {
                notify.notified().await;
                if rejected.load(Ordering::Acquire) {
                    Err(RelayError::new(RelayErrorKind::Rejected))
                } else {
                    Ok(self.make_token())
                }
            }
        }
    }

    pub async fn acquire_with_timeout(&self, duration: Duration) -> Result<Token, RelayError> {
        self.acquire_sized_with_timeout(0, duration).await
    }

    pub async fn acquire_sized_with_timeout(
        &self,
        memory: u64,
        duration: Duration,
    ) -> Result<Token, RelayError> {
        match self.admit_or_enqueue(memory) {
            Admission::Granted => Ok(self.make_token()),
            Admission::Rejected => Err(RelayError::new(RelayErrorKind::Rejected)),
            Admission::Queued(notify, rejected, id) => {
                match timeout(duration, notify.notified()).await {
                    Ok(()) => {
                        if rejected.load(Ordering::Acquire) {
                            Err(RelayError::new(RelayErrorKind::Rejected))
                        } else {
                            Ok(self.make_token())
                        }
                    }
                    Err(_) => {
                        // Remove our own entry if it is still queued. If it
                        // is gone, a concurrent release() already handed us
                        // a permit (or a DropOldest eviction already marked
                        // us rejected) between the timer firing and us
                        // taking the lock; in the permit case we must give
                        // it back so a timed-out caller never holds one.
                        let mut state = self.inner.state.lock();
                        if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
                            let waiter = state.waiters.remove(pos).expect("position just found");
                            state.queue_memory -= waiter.memory;
                            Err(RelayError::timeout(duration))
                        } else {
                            drop(state);
                            if rejected.load(Ordering::Acquire) {
                                Err(RelayError::new(RelayErrorKind::Rejected))
                            } else {
                                self.release_permit();
                                Err(RelayError::timeout(duration))
                            }
                        }
                    }
                }
            }
        }
    }

    /// Non-blocking admission check: succeeds only if a permit is free
    /// right now, never queues.
    pub fn try_acquire(&self) -> Result<Token, RelayError> {
        let mut state = self.inner.state.lock();
        if state.active < self.inner.config.capacity && self.within_outstanding_limit(&state) {
            state.active += 1;
            drop(state);
            Ok(self.make_token())
        } else {
            Err(RelayError::new(RelayErrorKind::Rejected))
        }
    }

    pub fn available_permits(&self) -> usize {
        let state = self.inner.state.lock();
        self.inner.config.capacity.saturating_sub(state.active)
    }

    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    fn within_outstanding_limit(&self, state: &State) -> bool {
        match self.inner.config.max_outstanding {
            Some(max) => state.active + state.waiters.len() < max,
            None => true,
        }
    }

    fn admit_or_enqueue(&self, memory: u64) -> Admission {
        let mut state = self.inner.state.lock();
        if state.active < self.inner.config.capacity && self.within_outstanding_limit(&state) {
            state.active += 1;
            return Admission::Granted;
        }

        match self.inner.config.strategy {
            BackpressureStrategy::Reject | BackpressureStrategy::DropNewest => Admission::Rejected,
            BackpressureStrategy::DropOldest => {
                if let Some(evicted) = state.waiters.pop_front() {
                    state.queue_memory -= evicted.memory;
                    evicted.rejected.store(true, Ordering::Release);
                    evicted.notify.notify_one();
                }
                self.enqueue(&mut state, memory)
            }
            BackpressureStrategy::Suspend => {
                if let Some(max_mem) = self.inner.config.max_queue_memory {
                    if state.queue_memory + memory > max_mem {
                        return Admission::Rejected;
                    }
                }
                if !self.within_outstanding_limit(&state) {
                    return Admission::Rejected;
                }
                self.enqueue(&mut state, memory)
            }
        }
    }

    fn enqueue(&self, state: &mut State, memory: u64) -> Admission {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let notify = Arc::new(Notify::new());
        let rejected = Arc::new(AtomicBool::new(false));
        state.waiters.push_back(Waiter {
            id,
            memory,
            notify: Arc::clone(&notify),
            rejected: Arc::clone(&rejected),
        });
        state.queue_memory += memory;
        Admission::Queued(notify, rejected, id)
    }

    fn release_permit(&self) {
        let mut state = self.inner.state.lock();
        if let Some(waiter) = state.waiters.pop_front() {
            state.queue_memory -= waiter.memory;
            // Permit transfers directly to the waiter; `active` is
            // unchanged (the releasing holder's slot becomes the waiter's).
            waiter.notify.notify_one();
        } else {
            state.active -= 1;
        }
    }

    fn make_token(&self) -> Token {
        Token {
            inner: Arc::clone(&self.inner),
            released: AtomicBool::new(false),
        }
    }
}

/// RAII admission permit. Releasing is idempotent whether done explicitly
/// via [`Token::release`] or implicitly on drop.
pub struct Token {
    inner: Arc<Inner>,
    released: AtomicBool,
}

impl Token {
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            let sem = Semaphore {
                inner: Arc::clone(&self.inner),
            };
            sem.release_permit();
        }
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.release();
    }
}
