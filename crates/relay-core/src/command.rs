//! `Command`/`Handler` contracts and middleware priority ordering.

use async_trait::async_trait;

use crate::context::CommandContext;
use crate::error::RelayResult;

/// A typed unit of work. `Result` is the value a [`Handler`] produces when
/// the chain reaches the end without being short-circuited by middleware.
pub trait Command: Send + Sync + 'static {
    type Result: Send + 'static;
}

/// The terminal step of a pipeline: turns a `C` into a `C::Result`.
#[async_trait]
pub trait Handler<C: Command>: Send + Sync + 'static {
    async fn handle(&self, command: C, ctx: &CommandContext) -> RelayResult<C::Result>;
}

#[async_trait]
impl<C, F, Fut> Handler<C> for F
where
    C: Command,
    F: Fn(C, &CommandContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = RelayResult<C::Result>> + Send,
{
    async fn handle(&self, command: C, ctx: &CommandContext) -> RelayResult<C::Result> {
        (self)(command, ctx).await
    }
}

/// Lower numeric value runs first. Middleware registered with equal
/// priority keep their registration order (stable sort, invariant P1).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i64);

impl Priority {
    pub const HIGHEST: Priority = Priority(i64::MIN);
    pub const LOWEST: Priority = Priority(i64::MAX);
    pub const DEFAULT: Priority = Priority(0);
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}
