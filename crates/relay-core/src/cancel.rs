//! Cooperative cancellation, ported from `spark-core::contract::Cancellation`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{RelayError, RelayResult};

/// A cheaply-cloneable cancellation flag shared across a command's whole
/// execution path, including everything spawned off a [`Self::child`].
#[derive(Clone, Debug)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Requests cancellation. Idempotent: the first caller to flip the flag
    /// wins, subsequent calls are no-ops.
    pub fn cancel(&self) {
        let _ = self
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// The `check_cancel` point from §4.4/§4.7/§9: fails with `Cancelled`
    /// carrying `context` if this token was cancelled, otherwise a no-op.
    /// Called before every middleware invocation and before each retry
    /// attempt (P5).
    pub fn check_cancel(&self, context: impl Into<Arc<str>>) -> RelayResult<()> {
        if self.is_cancelled() {
            Err(RelayError::cancelled(context))
        } else {
            Ok(())
        }
    }

    /// Returns a handle sharing the same underlying flag. Cancelling either
    /// one cancels both — this is not a new, independent token, it is the
    /// same token under a new name for call sites that want to pass it
    /// downward without naming the parent.
    pub fn child(&self) -> Self {
        self.clone()
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}
