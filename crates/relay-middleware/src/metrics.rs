//! Middleware that records per-command timing and outcome counters into a
//! [`MetricCollector`], grounded on `spark-middleware::metrics`'s pattern of
//! declaring instrument descriptors as module-level `const`s.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use relay_core::command::{Command, Priority};
use relay_core::context::CommandContext;
use relay_core::error::RelayResult;
use relay_core::middleware::{Middleware, Next};
use relay_metrics::{DataPoint, MetricCollector, MetricKind};

/// Describes a metric instrument for documentation/export purposes. Not
/// wired to a specific backend — the backend is whatever exporter the
/// caller attached to the [`MetricCollector`].
pub struct InstrumentDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub unit: Option<&'static str>,
}

impl InstrumentDescriptor {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            description: "",
            unit: None,
        }
    }

    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    pub const fn with_unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }
}

pub const METRIC_COMMAND_DURATION: InstrumentDescriptor = InstrumentDescriptor::new("relay_command_duration")
    .with_description("Wall-clock time spent executing a command through the remaining chain")
    .with_unit("ms");

pub const METRIC_COMMAND_TOTAL: InstrumentDescriptor = InstrumentDescriptor::new("relay_command_total")
    .with_description("Count of commands dispatched, tagged by outcome");

pub const METRIC_COMMAND_ERRORS: InstrumentDescriptor =
    InstrumentDescriptor::new("relay_command_errors_total")
        .with_description("Count of commands whose chain returned an error");

/// Wraps the remaining chain, recording duration and outcome counters
/// around it. Never fails the command itself if metric recording fails
/// (the collector being `Stopped`, say) — the result of `next` always wins.
pub struct MetricsMiddleware<C: Command> {
    collector: Arc<MetricCollector>,
    priority: Priority,
    _marker: PhantomData<fn() -> C>,
}

impl<C: Command> MetricsMiddleware<C> {
    pub fn new(collector: Arc<MetricCollector>) -> Self {
        Self {
            collector,
            priority: Priority(i64::MIN + 1),
            _marker: PhantomData,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

#[async_trait]
impl<C: Command> Middleware<C> for MetricsMiddleware<C> {
    fn priority(&self) -> Priority {
        self.priority
    }

    fn name(&self) -> &str {
        "metrics"
    }

    async fn execute(
        &self,
        command: C,
        ctx: Arc<CommandContext>,
        next: Next<C>,
    ) -> RelayResult<C::Result> {
        let start = Instant::now();
        let result = next.call(command, ctx).await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        let outcome = if result.is_ok() { "ok" } else { "error" };

        let _ = self.collector.record(
            DataPoint::new(METRIC_COMMAND_DURATION.name, MetricKind::Timer, elapsed_ms)
                .with_unit("ms")
                .with_tag("outcome", outcome),
        );
        let _ = self.collector.record(
            DataPoint::new(METRIC_COMMAND_TOTAL.name, MetricKind::Counter, 1.0)
                .with_tag("outcome", outcome),
        );
        if result.is_err() {
            let _ = self
                .collector
                .record(DataPoint::new(METRIC_COMMAND_ERRORS.name, MetricKind::Counter, 1.0));
        }

        result
    }
}
