//! `DynamicPipeline`: a runtime registry mapping a command's `TypeId` to a
//! type-erased [`StandardPipeline`], for services that need to register
//! handlers for command types unknown at compile time (§4.6).

use std::any::{Any, TypeId};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use relay_core::command::Command;
use relay_core::context::CommandContext;
use relay_core::error::{RelayError, RelayErrorKind, RelayResult};
use relay_core::time::SystemClock;
use relay_core::Handler;

use crate::retry::{RetryController, RetryPolicy};
use crate::standard::StandardPipeline;

#[async_trait]
trait ErasedEntry: Send + Sync {
    async fn dispatch(
        &self,
        command: Box<dyn Any + Send>,
        ctx: Arc<CommandContext>,
    ) -> RelayResult<Box<dyn Any + Send>>;
}

struct TypedEntry<C: Command, H: Handler<C>> {
    pipeline: Arc<StandardPipeline<C, H>>,
}

#[async_trait]
impl<C: Command, H: Handler<C>> ErasedEntry for TypedEntry<C, H> {
    async fn dispatch(
        &self,
        command: Box<dyn Any + Send>,
        ctx: Arc<CommandContext>,
    ) -> RelayResult<Box<dyn Any + Send>> {
        let command = *command
            .downcast::<C>()
            .map_err(|_| RelayError::new(RelayErrorKind::InvalidCommandType))?;
        let result = self.pipeline.execute(command, ctx).await?;
        Ok(Box::new(result))
    }
}

/// Holds one [`StandardPipeline`] per registered command type, erased
/// behind `TypeId`. Each registered pipeline keeps its own independent
/// middleware chain and handler.
#[derive(Default)]
pub struct DynamicPipeline {
    registry: DashMap<TypeId, Arc<dyn ErasedEntry>>,
}

impl DynamicPipeline {
    pub fn new() -> Self {
        Self {
            registry: DashMap::new(),
        }
    }

    /// Registers `handler` for command type `C`, replacing any existing
    /// registration, and returns the underlying [`StandardPipeline`] so
    /// callers can attach middleware to it.
    pub fn register<C, H>(&self, handler: Arc<H>) -> Arc<StandardPipeline<C, H>>
    where
        C: Command,
        H: Handler<C>,
    {
        let pipeline = Arc::new(StandardPipeline::new(handler));
        self.registry.insert(
            TypeId::of::<C>(),
            Arc::new(TypedEntry {
                pipeline: Arc::clone(&pipeline),
            }),
        );
        pipeline
    }

    /// Registers `handler` for `C` only if nothing is registered for it yet;
    /// fails rather than silently replacing an existing registration.
    pub fn register_once<C, H>(&self, handler: Arc<H>) -> RelayResult<Arc<StandardPipeline<C, H>>>
    where
        C: Command,
        H: Handler<C>,
    {
        if self.is_registered::<C>() {
            return Err(RelayError::new(RelayErrorKind::PipelineNotConfigured(
                std::any::type_name::<C>().into(),
            )));
        }
        Ok(self.register(handler))
    }

    /// Registers `handler` for `C` unconditionally, reporting whether a
    /// prior registration for `C` existed and was replaced.
    pub fn replace<C, H>(&self, handler: Arc<H>) -> (Arc<StandardPipeline<C, H>>, bool)
    where
        C: Command,
        H: Handler<C>,
    {
        let pipeline = Arc::new(StandardPipeline::new(handler));
        let previous = self.registry.insert(
            TypeId::of::<C>(),
            Arc::new(TypedEntry {
                pipeline: Arc::clone(&pipeline),
            }),
        );
        (pipeline, previous.is_some())
    }

    pub fn is_registered<C: Command>(&self) -> bool {
        self.registry.contains_key(&TypeId::of::<C>())
    }

    pub fn unregister<C: Command>(&self) -> bool {
        self.registry.remove(&TypeId::of::<C>()).is_some()
    }

    fn lookup<C: Command>(&self) -> RelayResult<Arc<dyn ErasedEntry>> {
        self.registry
            .get(&TypeId::of::<C>())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                RelayError::new(RelayErrorKind::HandlerNotFound(
                    std::any::type_name::<C>().into(),
                ))
            })
    }

    pub async fn dispatch<C: Command>(
        &self,
        command: C,
        ctx: Arc<CommandContext>,
    ) -> RelayResult<C::Result> {
        let entry = self.lookup::<C>()?;
        let boxed_command: Box<dyn Any + Send> = Box::new(command);
        let boxed_result = entry.dispatch(boxed_command, ctx).await?;
        boxed_result
            .downcast::<C::Result>()
            .map(|boxed| *boxed)
            .map_err(|_| RelayError::new(RelayErrorKind::InvalidResultType))
    }

    /// Resolves the handler for `C`, then drives a [`RetryController`]
    /// around repeated dispatch attempts (§4.6). `C` must be `Clone` since
    /// each attempt resubmits the same command value.
    pub async fn send<C>(
        &self,
        command: C,
        ctx: Arc<CommandContext>,
        retry_policy: Option<RetryPolicy>,
    ) -> RelayResult<C::Result>
    where
        C: Command + Clone,
    {
        let entry = self.lookup::<C>()?;
        let controller = RetryController::new(
            retry_policy.unwrap_or_default(),
            Arc::new(SystemClock),
        );
        let cancellation = ctx.cancellation().clone();

        controller
            .run(&cancellation, move |_attempt| {
                let entry = Arc::clone(&entry);
                let command = command.clone();
                let ctx = Arc::clone(&ctx);
                async move {
                    let boxed_command: Box<dyn Any + Send> = Box::new(command);
                    let boxed_result = entry.dispatch(boxed_command, ctx).await?;
                    boxed_result
                        .downcast::<C::Result>()
                        .map(|boxed| *boxed)
                        .map_err(|_| RelayError::new(RelayErrorKind::InvalidResultType))
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::RelayResult;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct Ping;
    impl Command for Ping {
        type Result = &'static str;
    }

    struct PingHandler;
    #[async_trait]
    impl Handler<Ping> for PingHandler {
        async fn handle(&self, _command: Ping, _ctx: &CommandContext) -> RelayResult<&'static str> {
            Ok("pong")
        }
    }

    struct Other;
    impl Command for Other {
        type Result = ();
    }
    struct OtherHandler;
    #[async_trait]
    impl Handler<Other> for OtherHandler {
        async fn handle(&self, _command: Other, _ctx: &CommandContext) -> RelayResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_type_and_rejects_unknown() {
        let dynamic = DynamicPipeline::new();
        dynamic.register::<Ping, _>(Arc::new(PingHandler));

        let result = dynamic
            .dispatch(Ping, Arc::new(CommandContext::new()))
            .await
            .unwrap();
        assert_eq!(result, "pong");

        let err = dynamic
            .dispatch(Other, Arc::new(CommandContext::new()))
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), RelayErrorKind::HandlerNotFound(_)));
    }

    #[tokio::test]
    async fn unregister_removes_the_handler() {
        let dynamic = DynamicPipeline::new();
        dynamic.register::<Ping, _>(Arc::new(PingHandler));
        assert!(dynamic.is_registered::<Ping>());
        assert!(dynamic.unregister::<Ping>());
        assert!(!dynamic.is_registered::<Ping>());
    }

    #[tokio::test]
    async fn other_handler_is_independently_registered_and_dispatched() {
        let dynamic = DynamicPipeline::new();
        dynamic.register::<Other, _>(Arc::new(OtherHandler));
        dynamic
            .dispatch(Other, Arc::new(CommandContext::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn register_once_fails_if_already_registered() {
        let dynamic = DynamicPipeline::new();
        dynamic.register::<Ping, _>(Arc::new(PingHandler));
        let err = dynamic
            .register_once::<Ping, _>(Arc::new(PingHandler))
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            RelayErrorKind::PipelineNotConfigured(_)
        ));
    }

    #[tokio::test]
    async fn replace_reports_whether_a_prior_registration_existed() {
        let dynamic = DynamicPipeline::new();
        let (_pipeline, existed) = dynamic.replace::<Ping, _>(Arc::new(PingHandler));
        assert!(!existed);
        let (_pipeline, existed) = dynamic.replace::<Ping, _>(Arc::new(PingHandler));
        assert!(existed);
    }

    #[tokio::test]
    async fn send_drives_retry_controller_until_success() {
        use crate::retry::{DelayStrategy, RetryPolicy};
        use std::time::Duration;

        struct FlakyHandler(Arc<AtomicUsize>);
        #[async_trait]
        impl Handler<Ping> for FlakyHandler {
            async fn handle(&self, _command: Ping, _ctx: &CommandContext) -> RelayResult<&'static str> {
                if self.0.fetch_add(1, Ordering::Relaxed) < 2 {
                    Err(RelayError::execution_failed("not yet"))
                } else {
                    Ok("pong")
                }
            }
        }

        let attempts = Arc::new(AtomicUsize::new(0));
        let dynamic = DynamicPipeline::new();
        dynamic.register::<Ping, _>(Arc::new(FlakyHandler(Arc::clone(&attempts))));

        let policy = RetryPolicy::new(5, DelayStrategy::Fixed(Duration::from_millis(1)));
        let result = dynamic
            .send(Ping, Arc::new(CommandContext::new()), Some(policy))
            .await
            .unwrap();
        assert_eq!(result, "pong");
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn send_rejects_unknown_command_type_without_retrying() {
        let dynamic = DynamicPipeline::new();
        let err = dynamic
            .send(Ping, Arc::new(CommandContext::new()), None)
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), RelayErrorKind::HandlerNotFound(_)));
    }
}
