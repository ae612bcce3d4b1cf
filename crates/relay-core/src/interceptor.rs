//! Pre-chain command transformers (§4.5 step 3, §9 "Interceptors vs
//! middleware"). An interceptor runs before the middleware chain is built
//! and may only rewrite the command; it never observes the result and is
//! not subject to the `NextGuard` forwarding contract — that distinction is
//! deliberate, to keep interceptors from growing middleware-shaped scope.

use async_trait::async_trait;

use crate::command::Command;
use crate::error::RelayResult;

/// Transforms a command before it enters the middleware chain. Interceptors
/// run in insertion order; each receives the previous interceptor's output.
#[async_trait]
pub trait Interceptor<C: Command>: Send + Sync + 'static {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn apply(&self, command: C) -> RelayResult<C>;
}
