//! Ready-made middleware built on `relay-core`'s contracts: structured
//! logging, a metrics-recording wrapper feeding `relay-metrics`, and a
//! per-middleware timeout guard.

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use logging::{LoggingMiddleware, LoggingMiddlewareConfig};
pub use metrics::{InstrumentDescriptor, MetricsMiddleware};
pub use timeout::TimeoutMiddleware;
