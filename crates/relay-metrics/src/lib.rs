//! Lock-free atomic storage, time-windowed aggregation and exporter
//! dispatch for metrics recorded by pipeline middleware.

pub mod atomic;
pub mod buffer;
pub mod collector;
pub mod datapoint;
pub mod exporter;
pub mod window;

pub use atomic::{AtomicCounter, AtomicGauge, AtomicStorage};
pub use buffer::MetricBuffer;
pub use collector::{CollectorConfig, CollectorState, CollectorStatistics, MetricCollector};
pub use datapoint::{DataPoint, MetricKind, Snapshot};
pub use exporter::{Exporter, ExporterDispatch, LoggingExporter, PrometheusTextExporter};
pub use window::{TimeWindowManager, TimeWindowManagerConfig, WindowAccumulator, WindowQueryResult};
