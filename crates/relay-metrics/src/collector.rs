//! `MetricCollector`: the buffered producer -> aggregator -> exporter
//! pipeline tying the rest of this crate together (§4.9).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use relay_core::error::{RelayError, RelayErrorKind, RelayResult};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::atomic::AtomicStorage;
use crate::buffer::MetricBuffer;
use crate::datapoint::{DataPoint, MetricKind};
use crate::exporter::{Exporter, ExporterDispatch};
use crate::window::{TimeWindowManager, TimeWindowManagerConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectorState {
    Idle,
    Collecting,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct CollectorConfig {
    pub window: TimeWindowManagerConfig,
    pub buffer_capacity: usize,
    pub flush_interval: Duration,
    pub stream_capacity: usize,
    /// Caps how many samples of a single metric `collect()` drains and
    /// aggregates per call (§4.9); the rest stay buffered for the next run.
    pub batch_size: usize,
    /// Spawns the background flush loop as soon as the collector is built,
    /// rather than requiring an explicit [`MetricCollector::start`] call.
    pub auto_start: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            window: TimeWindowManagerConfig::default(),
            buffer_capacity: 1024,
            flush_interval: Duration::from_secs(10),
            stream_capacity: 1024,
            batch_size: 256,
            auto_start: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CollectorStatistics {
    pub total_collected: u64,
    pub total_dropped: u64,
    pub buffer_count: usize,
    pub exporter_count: usize,
}

/// Buffers incoming [`DataPoint`]s into per-name ring buffers and
/// aggregates/exports them during the periodic collection loop. `record()`
/// is a pure, non-blocking buffer push; storage updates, window assignment
/// and stream broadcast all happen inside [`Self::collect`], batched by
/// `batch_size`, per §4.9's literal collection algorithm. `Idle` still
/// accepts `record`/`collect` calls, it just has no background flush loop
/// running; `Stopped` rejects new records.
pub struct MetricCollector {
    state: RwLock<CollectorState>,
    storage: AtomicStorage,
    buffers: DashMap<String, Arc<MetricBuffer>>,
    windows: TimeWindowManager,
    dispatch: ExporterDispatch,
    config: CollectorConfig,
    total_collected: AtomicU64,
    broadcaster: broadcast::Sender<DataPoint>,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MetricCollector {
    /// Builds the collector behind an `Arc`, auto-starting the background
    /// flush loop when `config.auto_start` is set.
    pub fn new(config: CollectorConfig) -> Arc<Self> {
        let (broadcaster, _) = broadcast::channel(config.stream_capacity.max(1));
        let auto_start = config.auto_start;
        let this = Arc::new(Self {
            state: RwLock::new(CollectorState::Idle),
            storage: AtomicStorage::new(),
            buffers: DashMap::new(),
            windows: TimeWindowManager::new(config.window.clone()),
            dispatch: ExporterDispatch::new(),
            config,
            total_collected: AtomicU64::new(0),
            broadcaster,
            flush_handle: Mutex::new(None),
        });
        if auto_start {
            this.start();
        }
        this
    }

    pub fn state(&self) -> CollectorState {
        *self.state.read()
    }

    pub fn add_exporter(&self, exporter: Arc<dyn Exporter>) {
        self.dispatch.add_exporter(exporter);
    }

    pub fn remove_exporter(&self, name: &str) -> bool {
        self.dispatch.remove_exporter(name)
    }

    pub fn stream(&self) -> broadcast::Receiver<DataPoint> {
        self.broadcaster.subscribe()
    }

    /// Pushes `point` into its name's ring buffer. Aggregation (storage,
    /// windows, stream broadcast) is deferred to the next [`Self::collect`].
    pub fn record(&self, point: DataPoint) -> RelayResult<()> {
        if self.state() == CollectorState::Stopped {
            return Err(RelayError::new(RelayErrorKind::PipelineNotConfigured(
                "collector is stopped".into(),
            )));
        }

        self.total_collected.fetch_add(1, Ordering::Relaxed);
        self.buffers
            .entry(point.name.clone())
            .or_insert_with(|| Arc::new(MetricBuffer::new(self.config.buffer_capacity)))
            .push(point);
        Ok(())
    }

    pub fn record_batch(&self, points: impl IntoIterator<Item = DataPoint>) -> RelayResult<()> {
        for point in points {
            self.record(point)?;
        }
        Ok(())
    }

    fn aggregate(&self, point: &DataPoint) {
        match point.kind {
            MetricKind::Counter => {
                self.storage
                    .increment_counter(&point.name, point.value.max(0.0) as u64);
            }
            MetricKind::Gauge => self.storage.set_gauge(&point.name, point.value),
            MetricKind::Histogram | MetricKind::Timer => {}
        }
        self.windows.record(point);
        let _ = self.broadcaster.send(point.clone());
    }

    /// Drains up to `batch_size` points per metric name, aggregates each
    /// (storage update, window record, stream broadcast) and fans the whole
    /// batch out to exporters. Safe to call manually even while `Idle`.
    pub async fn collect(&self) {
        let mut drained = Vec::new();
        for entry in self.buffers.iter() {
            let points = entry.value().drain_up_to(self.config.batch_size);
            for point in &points {
                self.aggregate(point);
            }
            drained.extend(points);
        }
        if !drained.is_empty() {
            self.dispatch.dispatch(Arc::new(drained)).await;
        }
    }

    /// Moves to `Collecting` and spawns a background task that calls
    /// [`Self::collect`] on `flush_interval`. Requires an `Arc` handle since
    /// the task outlives this call.
    pub fn start(self: &Arc<Self>) {
        *self.state.write() = CollectorState::Collecting;
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.flush_interval);
            loop {
                ticker.tick().await;
                if this.state() == CollectorState::Stopped {
                    break;
                }
                this.collect().await;
            }
        });
        *self.flush_handle.lock() = Some(handle);
    }

    /// Stops accepting new records and tears down the background flush
    /// loop. Does not drain remaining buffered points — call
    /// [`Self::collect`] first if that is desired.
    pub fn stop(&self) {
        *self.state.write() = CollectorState::Stopped;
        if let Some(handle) = self.flush_handle.lock().take() {
            handle.abort();
        }
    }

    pub fn statistics(&self) -> CollectorStatistics {
        let mut buffer_count = 0usize;
        let mut total_dropped = 0u64;
        for entry in self.buffers.iter() {
            buffer_count += entry.value().len();
            total_dropped += entry.value().dropped_count();
        }
        CollectorStatistics {
            total_collected: self.total_collected.load(Ordering::Relaxed),
            total_dropped,
            buffer_count,
            exporter_count: self.dispatch.exporter_count(),
        }
    }

    pub fn windows(&self) -> &TimeWindowManager {
        &self.windows
    }

    pub fn storage(&self) -> &AtomicStorage {
        &self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::LoggingExporter;

    #[tokio::test]
    async fn stopped_collector_rejects_new_records() {
        let collector = MetricCollector::new(CollectorConfig::default());
        collector.stop();
        let err = collector
            .record(DataPoint::new("m", MetricKind::Counter, 1.0))
            .unwrap_err();
        assert!(matches!(err.kind(), RelayErrorKind::PipelineNotConfigured(_)));
    }

    #[tokio::test]
    async fn collect_flushes_buffered_points_to_exporters() {
        let collector = MetricCollector::new(CollectorConfig::default());
        collector.add_exporter(Arc::new(LoggingExporter::default()));
        collector
            .record_batch(vec![
                DataPoint::new("a", MetricKind::Counter, 1.0),
                DataPoint::new("b", MetricKind::Gauge, 2.0),
            ])
            .unwrap();

        let stats_before = collector.statistics();
        assert_eq!(stats_before.buffer_count, 2);

        collector.collect().await;
        let stats_after = collector.statistics();
        assert_eq!(stats_after.buffer_count, 0);
        assert_eq!(stats_after.total_collected, 2);
        assert_eq!(collector.storage().counter_value("a"), 1);
    }

    /// §4.9: aggregation (storage/windows/stream) happens at `collect()`
    /// time, not at `record()` time — a recorded point is invisible to the
    /// stream until the next collection pass.
    #[tokio::test]
    async fn stream_only_receives_points_after_collect() {
        let collector = MetricCollector::new(CollectorConfig::default());
        let mut receiver = collector.stream();
        collector
            .record(DataPoint::new("x", MetricKind::Counter, 5.0))
            .unwrap();

        assert!(receiver.try_recv().is_err());

        collector.collect().await;
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.name, "x");
    }

    #[tokio::test]
    async fn collect_only_drains_up_to_batch_size_per_metric() {
        let collector = MetricCollector::new(CollectorConfig {
            batch_size: 2,
            ..CollectorConfig::default()
        });
        for i in 0..5 {
            collector
                .record(DataPoint::new("m", MetricKind::Counter, i as f64))
                .unwrap();
        }
        collector.collect().await;
        assert_eq!(collector.statistics().buffer_count, 3);
        assert_eq!(collector.storage().counter_value("m"), 1); // increments of 0 then 1

        collector.collect().await;
        assert_eq!(collector.statistics().buffer_count, 1);
    }
}
