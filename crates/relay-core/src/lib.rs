//! Contracts shared by the whole relay workspace: commands, handlers,
//! middleware, the per-command context, cancellation, the clock
//! abstraction, admission control and the error taxonomy.
//!
//! Pipeline assembly (`StandardPipeline`/`DynamicPipeline`) and retry live
//! in `relay-pipeline`; the metrics engine lives in `relay-metrics`.

pub mod cancel;
pub mod command;
pub mod context;
pub mod error;
pub mod interceptor;
pub mod middleware;
pub mod semaphore;
pub mod time;

pub use cancel::Cancellation;
pub use command::{Command, Handler, Priority};
pub use context::{CommandContext, TypedKey};
pub use error::{ErrorContext, RelayError, RelayErrorKind, RelayResult};
pub use interceptor::Interceptor;
pub use middleware::{Middleware, Next, NextFn, NextGuard};
pub use semaphore::{BackpressureStrategy, Semaphore, SemaphoreConfig, Token};
pub use time::{Clock, MockClock, SystemClock};
