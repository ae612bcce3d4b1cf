//! Per-middleware timeout wrapper (SPEC_FULL `TimeoutWrapper` note): bounds
//! how long the remaining chain is allowed to run before the middleware
//! itself returns [`RelayErrorKind::Timeout`].

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::command::{Command, Priority};
use relay_core::context::CommandContext;
use relay_core::error::{RelayError, RelayResult};
use relay_core::middleware::{Middleware, Next};

pub struct TimeoutMiddleware<C: Command> {
    duration: Duration,
    priority: Priority,
    _marker: PhantomData<fn() -> C>,
}

impl<C: Command> TimeoutMiddleware<C> {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            priority: Priority::DEFAULT,
            _marker: PhantomData,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

#[async_trait]
impl<C: Command> Middleware<C> for TimeoutMiddleware<C> {
    fn priority(&self) -> Priority {
        self.priority
    }

    fn name(&self) -> &str {
        "timeout"
    }

    async fn execute(
        &self,
        command: C,
        ctx: Arc<CommandContext>,
        next: Next<C>,
    ) -> RelayResult<C::Result> {
        match tokio::time::timeout(self.duration, next.call(command, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::timeout(self.duration)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::middleware::{NextFn, NextGuard};

    struct Noop;
    impl Command for Noop {
        type Result = ();
    }

    fn never_resolving_next() -> NextFn<Noop> {
        Arc::new(|_command: Noop, _ctx: Arc<CommandContext>| {
            Box::pin(async {
                std::future::pending::<()>().await;
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn timeout_fires_when_chain_never_completes() {
        let middleware = TimeoutMiddleware::<Noop>::new(Duration::from_millis(10));
        let guard = Arc::new(NextGuard::new(never_resolving_next(), "test", true));
        let err = middleware
            .execute(Noop, Arc::new(CommandContext::new()), Next::Guarded(guard))
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            relay_core::error::RelayErrorKind::Timeout(_)
        ));
    }
}
