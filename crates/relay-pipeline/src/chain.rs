//! Folds an ordered list of middleware and a terminal handler into one
//! callable continuation (§4.3).

use std::sync::Arc;

use relay_core::command::Command;
use relay_core::context::CommandContext;
use relay_core::error::{RelayError, RelayErrorKind, RelayResult};
use relay_core::middleware::{Middleware, Next, NextFn, NextGuard};
use relay_core::Handler;

/// Builds the single continuation a pipeline dispatches into. Middleware
/// are folded right-to-left so the first one pushed is the first one that
/// runs; each wraps the next one's continuation with a [`NextGuard`] unless
/// it opted out via [`Middleware::is_unsafe`].
pub struct ChainBuilder<C: Command> {
    middleware: Vec<Arc<dyn Middleware<C>>>,
    max_depth: Option<usize>,
}

impl<C: Command> ChainBuilder<C> {
    pub fn new() -> Self {
        Self {
            middleware: Vec::new(),
            max_depth: None,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = Some(max_depth);
        self
    }

    pub fn push(mut self, middleware: Arc<dyn Middleware<C>>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn extend(mut self, middleware: impl IntoIterator<Item = Arc<dyn Middleware<C>>>) -> Self {
        self.middleware.extend(middleware);
        self
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Assembles the chain. Fails fast with [`RelayErrorKind::MaxDepthExceeded`]
    /// if a depth cap was configured and exceeded; otherwise always succeeds.
    pub fn build<H>(self, handler: Arc<H>) -> RelayResult<NextFn<C>>
    where
        H: Handler<C>,
    {
        if let Some(max) = self.max_depth {
            if self.middleware.len() > max {
                return Err(RelayError::new(RelayErrorKind::MaxDepthExceeded {
                    len: self.middleware.len(),
                    max,
                }));
            }
        }

        let mut next: NextFn<C> = {
            let handler = Arc::clone(&handler);
            Arc::new(move |command: C, ctx: Arc<CommandContext>| {
                let handler = Arc::clone(&handler);
                Box::pin(async move { handler.handle(command, &ctx).await })
            })
        };

        for middleware in self.middleware.into_iter().rev() {
            let inner_next = next;
            let middleware_name: Arc<str> = Arc::from(middleware.name());
            next = Arc::new(move |command: C, ctx: Arc<CommandContext>| {
                let middleware = Arc::clone(&middleware);
                let inner_next = Arc::clone(&inner_next);
                let middleware_name = Arc::clone(&middleware_name);
                Box::pin(async move {
                    ctx.cancellation().check_cancel(middleware_name)?;
                    if !middleware.should_activate(&command, &ctx) {
                        return inner_next(command, ctx).await;
                    }
                    let wrapped = if middleware.is_unsafe() {
                        Next::Unguarded(Arc::clone(&inner_next))
                    } else {
                        Next::Guarded(Arc::new(NextGuard::new(
                            Arc::clone(&inner_next),
                            middleware.name().to_string(),
                            middleware.suppress_drop_warning(),
                        )))
                    };
                    middleware.execute(command, ctx, wrapped).await
                })
            });
        }

        Ok(next)
    }
}

impl<C: Command> Default for ChainBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_core::cancel::Cancellation;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;
    impl Command for Echo {
        type Result = u32;
    }

    struct EchoHandler;
    #[async_trait]
    impl Handler<Echo> for EchoHandler {
        async fn handle(&self, _command: Echo, _ctx: &CommandContext) -> RelayResult<u32> {
            Ok(7)
        }
    }

    struct Counting(Arc<AtomicUsize>);
    #[async_trait]
    impl Middleware<Echo> for Counting {
        async fn execute(
            &self,
            command: Echo,
            ctx: Arc<CommandContext>,
            next: Next<Echo>,
        ) -> RelayResult<u32> {
            self.0.fetch_add(1, Ordering::Relaxed);
            next.call(command, ctx).await
        }
    }

    #[tokio::test]
    async fn cancellation_before_a_middleware_prevents_it_from_running() {
        let count = Arc::new(AtomicUsize::new(0));
        let chain = ChainBuilder::new()
            .push(Arc::new(Counting(Arc::clone(&count))))
            .build(Arc::new(EchoHandler))
            .unwrap();

        let cancellation = Cancellation::new();
        cancellation.cancel();
        let ctx = Arc::new(CommandContext::with_cancellation(cancellation));

        let err = chain(Echo, ctx).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn build_fails_fast_when_depth_cap_is_exceeded() {
        let count = Arc::new(AtomicUsize::new(0));
        let result = ChainBuilder::new()
            .with_max_depth(1)
            .push(Arc::new(Counting(Arc::clone(&count))))
            .push(Arc::new(Counting(Arc::clone(&count))))
            .build(Arc::new(EchoHandler));

        assert!(matches!(
            result.unwrap_err().kind(),
            RelayErrorKind::MaxDepthExceeded { len: 2, max: 1 }
        ));
    }
}
