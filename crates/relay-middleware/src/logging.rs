//! Structured request logging middleware, grounded on
//! `spark-middleware::logging`'s `LoggingMiddlewareConfig` shape.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use relay_core::command::{Command, Priority};
use relay_core::context::CommandContext;
use relay_core::error::RelayResult;
use relay_core::middleware::{Middleware, Next};

#[derive(Clone, Debug)]
pub struct LoggingMiddlewareConfig {
    pub label: String,
    pub severity: tracing::Level,
    pub priority: Priority,
}

impl Default for LoggingMiddlewareConfig {
    fn default() -> Self {
        Self {
            label: "logging".to_string(),
            severity: tracing::Level::INFO,
            priority: Priority::HIGHEST,
        }
    }
}

fn log_started(level: tracing::Level, label: &str, request_id: &str) {
    match level {
        tracing::Level::TRACE => tracing::trace!(middleware = label, request_id, "command started"),
        tracing::Level::DEBUG => tracing::debug!(middleware = label, request_id, "command started"),
        tracing::Level::INFO => tracing::info!(middleware = label, request_id, "command started"),
        tracing::Level::WARN => tracing::warn!(middleware = label, request_id, "command started"),
        tracing::Level::ERROR => tracing::error!(middleware = label, request_id, "command started"),
    }
}

fn log_completed(level: tracing::Level, label: &str, request_id: &str, elapsed_ms: u128) {
    match level {
        tracing::Level::TRACE => {
            tracing::trace!(middleware = label, request_id, elapsed_ms, "command completed")
        }
        tracing::Level::DEBUG => {
            tracing::debug!(middleware = label, request_id, elapsed_ms, "command completed")
        }
        tracing::Level::INFO => {
            tracing::info!(middleware = label, request_id, elapsed_ms, "command completed")
        }
        tracing::Level::WARN => {
            tracing::warn!(middleware = label, request_id, elapsed_ms, "command completed")
        }
        tracing::Level::ERROR => {
            tracing::error!(middleware = label, request_id, elapsed_ms, "command completed")
        }
    }
}

/// Logs a start event at the configured severity and a completion/failure
/// event once the rest of the chain returns.
pub struct LoggingMiddleware<C: Command> {
    config: LoggingMiddlewareConfig,
    _marker: PhantomData<fn() -> C>,
}

impl<C: Command> LoggingMiddleware<C> {
    pub fn new(config: LoggingMiddlewareConfig) -> Self {
        Self {
            config,
            _marker: PhantomData,
        }
    }
}

impl<C: Command> Default for LoggingMiddleware<C> {
    fn default() -> Self {
        Self::new(LoggingMiddlewareConfig::default())
    }
}

#[async_trait]
impl<C: Command> Middleware<C> for LoggingMiddleware<C> {
    fn priority(&self) -> Priority {
        self.config.priority
    }

    fn name(&self) -> &str {
        &self.config.label
    }

    async fn execute(
        &self,
        command: C,
        ctx: Arc<CommandContext>,
        next: Next<C>,
    ) -> RelayResult<C::Result> {
        let request_id = ctx.request_id().to_string();
        log_started(self.config.severity, &self.config.label, &request_id);
        let start = Instant::now();
        let result = next.call(command, ctx).await;
        let elapsed_ms = start.elapsed().as_millis();
        match &result {
            Ok(_) => log_completed(self.config.severity, &self.config.label, &request_id, elapsed_ms),
            Err(err) => tracing::warn!(
                middleware = %self.config.label,
                request_id,
                elapsed_ms,
                error = %err,
                "command failed"
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::middleware::NextGuard;
    use tracing_test::traced_test;

    struct Noop;
    impl Command for Noop {
        type Result = ();
    }

    #[tokio::test]
    #[traced_test]
    async fn logs_start_and_completion() {
        let middleware = LoggingMiddleware::<Noop>::default();
        let next = Arc::new(NextGuard::new(
            Arc::new(|_command: Noop, _ctx: Arc<CommandContext>| {
                Box::pin(async { Ok(()) })
            }),
            "terminal",
            true,
        ));
        middleware
            .execute(
                Noop,
                Arc::new(CommandContext::new()),
                relay_core::middleware::Next::Guarded(next),
            )
            .await
            .unwrap();
        assert!(logs_contain("command started"));
        assert!(logs_contain("command completed"));
    }
}
