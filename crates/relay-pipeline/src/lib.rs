//! Chain assembly and pipeline dispatch built on top of `relay-core`'s
//! contracts: a fixed-type [`standard::StandardPipeline`], a type-erased
//! [`dynamic::DynamicPipeline`], and the [`retry::RetryController`].

pub mod chain;
pub mod dynamic;
pub mod retry;
pub mod standard;

pub use chain::ChainBuilder;
pub use dynamic::DynamicPipeline;
pub use retry::{DelayStrategy, RetryController, RetryPolicy};
pub use standard::{MiddlewareId, StandardPipeline};
