//! Exporter contract and concurrent, non-blocking fan-out dispatch (§4.12).
//!
//! Grounded on `otap-df-telemetry`'s use of the `prometheus` crate for a
//! text-exposition backend; the `LoggingExporter` mirrors
//! `spark-middleware::logging`'s structured `tracing` style.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use relay_core::error::{RelayError, RelayResult};

use crate::datapoint::{DataPoint, MetricKind};

#[async_trait]
pub trait Exporter: Send + Sync + 'static {
    fn name(&self) -> &str;
    async fn export(&self, points: &[DataPoint]) -> RelayResult<()>;
}

/// Fans a batch of points out to every registered exporter concurrently.
/// One exporter failing never blocks or fails the others; failures are
/// only recorded in a per-exporter counter.
#[derive(Default)]
pub struct ExporterDispatch {
    exporters: RwLock<Vec<Arc<dyn Exporter>>>,
    export_errors: DashMap<String, AtomicU64>,
}

impl ExporterDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_exporter(&self, exporter: Arc<dyn Exporter>) {
        self.exporters.write().push(exporter);
    }

    pub fn remove_exporter(&self, name: &str) -> bool {
        let mut exporters = self.exporters.write();
        let before = exporters.len();
        exporters.retain(|exporter| exporter.name() != name);
        exporters.len() != before
    }

    pub fn exporter_count(&self) -> usize {
        self.exporters.read().len()
    }

    pub async fn dispatch(&self, points: Arc<Vec<DataPoint>>) {
        let exporters: Vec<Arc<dyn Exporter>> = self.exporters.read().clone();
        let tasks = exporters.into_iter().map(|exporter| {
            let points = Arc::clone(&points);
            async move {
                let name = exporter.name().to_string();
                let outcome = exporter.export(&points).await;
                (name, outcome)
            }
        });

        for (name, outcome) in futures::future::join_all(tasks).await {
            if let Err(err) = outcome {
                tracing::warn!(exporter = %name, error = %err, "exporter failed");
                self.export_errors
                    .entry(name)
                    .or_insert_with(|| AtomicU64::new(0))
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn export_error_count(&self, name: &str) -> u64 {
        self.export_errors
            .get(name)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// Writes every exported point as a structured `tracing` event.
pub struct LoggingExporter {
    name: String,
}

impl LoggingExporter {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LoggingExporter {
    fn default() -> Self {
        Self::new("logging")
    }
}

#[async_trait]
impl Exporter for LoggingExporter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn export(&self, points: &[DataPoint]) -> RelayResult<()> {
        for point in points {
            tracing::info!(
                metric = %point.name,
                kind = ?point.kind,
                value = point.value,
                "metric"
            );
        }
        Ok(())
    }
}

fn sanitize_metric_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Renders the latest exported batch as Prometheus text exposition format,
/// built on the real `prometheus` crate's `Registry`/`TextEncoder` rather
/// than hand-rolled formatting. Holds no network socket of its own — a
/// scrape endpoint built on top of this workspace reads [`Self::render`].
///
/// Each distinct metric name is registered once, with the label names taken
/// from the first point seen for that name; histograms/timers are exposed
/// as gauges of their latest value since this workspace does not track
/// bucket boundaries.
pub struct PrometheusTextExporter {
    name: String,
    registry: Registry,
    counters: DashMap<String, (CounterVec, Vec<String>)>,
    gauges: DashMap<String, (GaugeVec, Vec<String>)>,
    rendered: RwLock<String>,
}

impl PrometheusTextExporter {
    pub fn new() -> Self {
        Self {
            name: "prometheus_text".to_string(),
            registry: Registry::new(),
            counters: DashMap::new(),
            gauges: DashMap::new(),
            rendered: RwLock::new(String::new()),
        }
    }

    pub fn render(&self) -> String {
        self.rendered.read().clone()
    }

    fn label_names(point: &DataPoint) -> Vec<String> {
        let mut names: Vec<String> = point.tags.keys().cloned().collect();
        names.sort();
        names
    }

    fn label_values<'a>(point: &'a DataPoint, names: &[String]) -> Vec<&'a str> {
        names
            .iter()
            .map(|name| point.tags.get(name).map(String::as_str).unwrap_or(""))
            .collect()
    }

    fn counter_for(&self, point: &DataPoint) -> RelayResult<(CounterVec, Vec<String>)> {
        if let Some(entry) = self.counters.get(&point.name) {
            return Ok(entry.value().clone());
        }
        let names = Self::label_names(point);
        let label_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let metric_name = sanitize_metric_name(&point.name);
        let opts = Opts::new(metric_name, format!("{} (counter)", point.name));
        let vec = CounterVec::new(opts, &label_refs)
            .map_err(|err| RelayError::execution_failed(err.to_string()))?;
        self.registry
            .register(Box::new(vec.clone()))
            .map_err(|err| RelayError::execution_failed(err.to_string()))?;
        self.counters.insert(point.name.clone(), (vec.clone(), names.clone()));
        Ok((vec, names))
    }

    fn gauge_for(&self, point: &DataPoint) -> RelayResult<(GaugeVec, Vec<String>)> {
        if let Some(entry) = self.gauges.get(&point.name) {
            return Ok(entry.value().clone());
        }
        let names = Self::label_names(point);
        let label_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let metric_name = sanitize_metric_name(&point.name);
        let opts = Opts::new(metric_name, format!("{} (gauge)", point.name));
        let vec = GaugeVec::new(opts, &label_refs)
            .map_err(|err| RelayError::execution_failed(err.to_string()))?;
        self.registry
            .register(Box::new(vec.clone()))
            .map_err(|err| RelayError::execution_failed(err.to_string()))?;
        self.gauges.insert(point.name.clone(), (vec.clone(), names.clone()));
        Ok((vec, names))
    }
}

impl Default for PrometheusTextExporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exporter for PrometheusTextExporter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn export(&self, points: &[DataPoint]) -> RelayResult<()> {
        for point in points {
            match point.kind {
                MetricKind::Counter => {
                    let (vec, names) = self.counter_for(point)?;
                    let values = Self::label_values(point, &names);
                    vec.with_label_values(&values).inc_by(point.value.max(0.0));
                }
                MetricKind::Gauge | MetricKind::Histogram | MetricKind::Timer => {
                    let (vec, names) = self.gauge_for(point)?;
                    let values = Self::label_values(point, &names);
                    vec.with_label_values(&values).set(point.value);
                }
            }
        }

        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| RelayError::execution_failed(err.to_string()))?;
        *self.rendered.write() = String::from_utf8_lossy(&buffer).into_owned();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingExporter;
    #[async_trait]
    impl Exporter for FailingExporter {
        fn name(&self) -> &str {
            "failing"
        }
        async fn export(&self, _points: &[DataPoint]) -> RelayResult<()> {
            Err(relay_core::error::RelayError::execution_failed("boom"))
        }
    }

    #[tokio::test]
    async fn one_exporter_failing_does_not_block_others() {
        let dispatch = ExporterDispatch::new();
        dispatch.add_exporter(Arc::new(FailingExporter));
        dispatch.add_exporter(Arc::new(LoggingExporter::default()));

        let points = Arc::new(vec![DataPoint::new("m", MetricKind::Counter, 1.0)]);
        dispatch.dispatch(points).await;

        assert_eq!(dispatch.export_error_count("failing"), 1);
        assert_eq!(dispatch.export_error_count("logging"), 0);
    }

    #[tokio::test]
    async fn prometheus_exporter_renders_labels() {
        let exporter = PrometheusTextExporter::new();
        let point = DataPoint::new("http_requests", MetricKind::Counter, 42.0)
            .with_tag("route", "/health");
        exporter.export(&[point]).await.unwrap();
        let rendered = exporter.render();
        assert!(rendered.contains("http_requests"));
        assert!(rendered.contains("route"));
        assert!(rendered.contains("/health"));
        assert!(rendered.contains("42"));
    }

    #[tokio::test]
    async fn prometheus_exporter_accumulates_repeated_counter_observations() {
        let exporter = PrometheusTextExporter::new();
        exporter
            .export(&[DataPoint::new("requests_total", MetricKind::Counter, 1.0)])
            .await
            .unwrap();
        exporter
            .export(&[DataPoint::new("requests_total", MetricKind::Counter, 1.0)])
            .await
            .unwrap();
        let rendered = exporter.render();
        assert!(rendered.contains('2'));
    }
}
