//! Middleware contract, `NextGuard` and the `Next` continuation handed to
//! each middleware's `execute`.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::command::{Command, Priority};
use crate::context::CommandContext;
use crate::error::{RelayError, RelayResult};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The remaining chain, callable exactly once under normal ("safe")
/// middleware. The continuation itself has no intrinsic call limit — the
/// limit is enforced by [`NextGuard`], which is what `execute` actually
/// receives unless the middleware opted out via [`Middleware::is_unsafe`].
pub type NextFn<C> = Arc<
    dyn Fn(C, Arc<CommandContext>) -> BoxFuture<'static, RelayResult<<C as Command>::Result>>
        + Send
        + Sync,
>;

/// Wraps a [`NextFn`] and enforces the "forward exactly once" contract
/// (§4.1): a second call returns [`RelayError::NextCalledTwice`], and if the
/// guard is dropped without ever being called it logs a warning (unless the
/// middleware is marked [`Middleware::suppress_drop_warning`]).
pub struct NextGuard<C: Command> {
    inner: NextFn<C>,
    label: Arc<str>,
    called: AtomicBool,
    suppress_warning: bool,
}

impl<C: Command> NextGuard<C> {
    pub fn new(inner: NextFn<C>, label: impl Into<Arc<str>>, suppress_warning: bool) -> Self {
        Self {
            inner,
            label: label.into(),
            called: AtomicBool::new(false),
            suppress_warning,
        }
    }

    pub async fn call(&self, command: C, ctx: Arc<CommandContext>) -> RelayResult<C::Result> {
        if self.called.swap(true, Ordering::AcqRel) {
            return Err(RelayError::next_called_twice(self.label.clone()));
        }
        (self.inner)(command, ctx).await
    }

    pub fn was_called(&self) -> bool {
        self.called.load(Ordering::Acquire)
    }
}

impl<C: Command> Drop for NextGuard<C> {
    fn drop(&mut self) {
        if !self.called.load(Ordering::Acquire) && !self.suppress_warning {
            tracing::warn!(
                middleware = %self.label,
                "middleware dropped its continuation without calling next()"
            );
        }
    }
}

/// The continuation a middleware's `execute` receives. `Guarded` enforces
/// single-use; `Unguarded` is handed to middleware that opted out via
/// [`Middleware::is_unsafe`] and may call the remaining chain any number of
/// times (including zero), at the middleware author's own risk.
pub enum Next<C: Command> {
    Guarded(Arc<NextGuard<C>>),
    Unguarded(NextFn<C>),
}

impl<C: Command> Next<C> {
    pub async fn call(&self, command: C, ctx: Arc<CommandContext>) -> RelayResult<C::Result> {
        match self {
            Next::Guarded(guard) => guard.call(command, ctx).await,
            Next::Unguarded(next) => next(command, ctx).await,
        }
    }
}

impl<C: Command> Clone for Next<C> {
    fn clone(&self) -> Self {
        match self {
            Next::Guarded(guard) => Next::Guarded(Arc::clone(guard)),
            Next::Unguarded(next) => Next::Unguarded(Arc::clone(next)),
        }
    }
}

/// A single link in a command's processing chain.
#[async_trait]
pub trait Middleware<C: Command>: Send + Sync + 'static {
    /// Lower values run closer to the front of the chain. Ties keep
    /// registration order (P1).
    fn priority(&self) -> Priority {
        Priority::DEFAULT
    }

    /// Human-readable identifier used in logs and `NextCalledTwice` errors.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Opts out of the `NextGuard` single-call contract. Exists for
    /// middleware that legitimately needs to invoke the remaining chain
    /// more than once (e.g. a speculative-retry middleware); the tradeoff
    /// is no protection against accidental double-forwarding.
    fn is_unsafe(&self) -> bool {
        false
    }

    /// Suppresses the "dropped without calling next()" warning for
    /// middleware that intentionally short-circuits (e.g. a cache hit).
    fn suppress_drop_warning(&self) -> bool {
        false
    }

    /// Conditional middleware is skipped entirely (chain proceeds straight
    /// to `next`) when this returns `false`.
    fn should_activate(&self, _command: &C, _ctx: &CommandContext) -> bool {
        true
    }

    async fn execute(
        &self,
        command: C,
        ctx: Arc<CommandContext>,
        next: Next<C>,
    ) -> RelayResult<C::Result>;
}
