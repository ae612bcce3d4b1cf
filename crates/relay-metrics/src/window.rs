//! Fixed-duration, epoch-aligned time windows with kind-specific
//! aggregation (§4.10–4.11, invariant P9).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::datapoint::{DataPoint, MetricKind};

/// Bounds the number of raw samples a histogram/timer accumulator keeps for
/// quantile estimation. Beyond this, newest samples evict the oldest —
/// adequate for the dashboards this feeds, not a production-grade sketch.
const MAX_SAMPLES: usize = 1024;

#[derive(Clone, Debug, Default)]
pub struct WindowAccumulator {
    kind: Option<MetricKind>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    last: f64,
    samples: Vec<f64>,
}

impl WindowAccumulator {
    fn observe(&mut self, kind: MetricKind, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.kind = Some(kind);
        self.count += 1;
        self.sum += value;
        self.last = value;
        if matches!(kind, MetricKind::Histogram | MetricKind::Timer) {
            if self.samples.len() >= MAX_SAMPLES {
                self.samples.remove(0);
            }
            self.samples.push(value);
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn last(&self) -> f64 {
        self.last
    }

    /// `q` in `[0.0, 1.0]`. `None` if no samples were recorded (counters and
    /// gauges never populate `samples`).
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).expect("metric values are never NaN"));
        let idx = (((sorted.len() - 1) as f64) * q.clamp(0.0, 1.0)).round() as usize;
        sorted.get(idx).copied()
    }

    /// The single summary value export backends should read for this
    /// metric's kind: the running total for counters, the latest set point
    /// for gauges, the mean for histograms/timers.
    pub fn representative_value(&self) -> f64 {
        match self.kind {
            Some(MetricKind::Counter) => self.sum,
            Some(MetricKind::Gauge) => self.last,
            Some(MetricKind::Histogram) | Some(MetricKind::Timer) => self.mean(),
            None => 0.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TimeWindowManagerConfig {
    /// A sample is assigned to a window for each of these durations (§4.10):
    /// e.g. `{60s, 300s}` means every recorded point lands in both a
    /// 1-minute and a 5-minute window simultaneously.
    pub window_durations: BTreeSet<Duration>,
    pub max_windows_per_duration: usize,
    /// How often the background rotation task checks for windows to evict.
    pub rotation_check_interval: Duration,
}

impl Default for TimeWindowManagerConfig {
    fn default() -> Self {
        let mut window_durations = BTreeSet::new();
        window_durations.insert(Duration::from_secs(60));
        Self {
            window_durations,
            max_windows_per_duration: 60,
            rotation_check_interval: Duration::from_secs(30),
        }
    }
}

struct Window {
    index: u64,
    accumulators: HashMap<String, WindowAccumulator>,
}

/// One metric sample, resolved against a query (§4.10 `query`).
#[derive(Clone, Debug)]
pub struct WindowQueryResult {
    pub metric_name: String,
    pub duration: Duration,
    pub window_start: SystemTime,
    pub window_end: SystemTime,
    pub accumulator: WindowAccumulator,
}

/// Assigns each recorded point to the window covering
/// `floor(t / duration) * duration`, for every configured duration, so two
/// points within the same aligned interval always land in the same window
/// regardless of arrival order (P9).
pub struct TimeWindowManager {
    config: TimeWindowManagerConfig,
    buckets: Mutex<HashMap<Duration, Vec<Window>>>,
}

impl TimeWindowManager {
    pub fn new(config: TimeWindowManagerConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn window_index(duration: Duration, timestamp: SystemTime) -> u64 {
        let since_epoch = timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        let duration_nanos = duration.as_nanos().max(1);
        (since_epoch.as_nanos() / duration_nanos) as u64
    }

    fn window_bounds(duration: Duration, index: u64) -> (SystemTime, SystemTime) {
        let start = UNIX_EPOCH + duration * index as u32;
        (start, start + duration)
    }

    pub fn window_start(&self, duration: Duration, timestamp: SystemTime) -> SystemTime {
        let index = Self::window_index(duration, timestamp);
        Self::window_bounds(duration, index).0
    }

    /// Adds `point` to the window covering its timestamp, once per
    /// configured duration.
    pub fn record(&self, point: &DataPoint) {
        let mut buckets = self.buckets.lock();
        for &duration in &self.config.window_durations {
            let index = Self::window_index(duration, point.timestamp);
            let windows = buckets.entry(duration).or_default();

            let position = windows.iter().position(|w| w.index == index);
            let window = match position {
                Some(pos) => &mut windows[pos],
                None => {
                    windows.push(Window {
                        index,
                        accumulators: HashMap::new(),
                    });
                    Self::evict_overflow(windows, self.config.max_windows_per_duration);
                    windows
                        .iter_mut()
                        .find(|w| w.index == index)
                        .expect("window just inserted")
                }
            };

            window
                .accumulators
                .entry(point.name.clone())
                .or_default()
                .observe(point.kind, point.value);
        }
    }

    fn evict_overflow(windows: &mut Vec<Window>, max_windows: usize) {
        if windows.len() > max_windows {
            windows.sort_by_key(|w| w.index);
            let overflow = windows.len() - max_windows;
            windows.drain(0..overflow);
        }
    }

    /// A snapshot of every retained window for `duration`, oldest first, as
    /// `(window_start, metric_name -> accumulator)`.
    pub fn snapshot(&self, duration: Duration) -> Vec<(SystemTime, HashMap<String, WindowAccumulator>)> {
        let buckets = self.buckets.lock();
        let mut windows: Vec<(SystemTime, HashMap<String, WindowAccumulator>)> = buckets
            .get(&duration)
            .map(|windows| {
                windows
                    .iter()
                    .map(|w| (Self::window_bounds(duration, w.index).0, w.accumulators.clone()))
                    .collect()
            })
            .unwrap_or_default();
        windows.sort_by_key(|(start, _)| *start);
        windows
    }

    pub fn window_count(&self, duration: Duration) -> usize {
        self.buckets
            .lock()
            .get(&duration)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Reads back windowed samples, filtered by metric name glob, a subset
    /// of configured durations, and a time range. A window matches the time
    /// range when it overlaps it: `window.start <= range.end && window.end
    /// >= range.start` (§4.10).
    pub fn query(
        &self,
        name_pattern: Option<&str>,
        window_durations: Option<&[Duration]>,
        time_range: Option<(SystemTime, SystemTime)>,
    ) -> Vec<WindowQueryResult> {
        let buckets = self.buckets.lock();
        let durations: Vec<Duration> = match window_durations {
            Some(durations) => durations.to_vec(),
            None => self.config.window_durations.iter().copied().collect(),
        };

        let mut results = Vec::new();
        for duration in durations {
            let Some(windows) = buckets.get(&duration) else {
                continue;
            };
            for window in windows {
                let (window_start, window_end) = Self::window_bounds(duration, window.index);
                if let Some((range_start, range_end)) = time_range {
                    if !(window_start <= range_end && window_end >= range_start) {
                        continue;
                    }
                }
                for (metric_name, accumulator) in &window.accumulators {
                    if let Some(pattern) = name_pattern {
                        if !pattern_matches(pattern, metric_name) {
                            continue;
                        }
                    }
                    results.push(WindowQueryResult {
                        metric_name: metric_name.clone(),
                        duration,
                        window_start,
                        window_end,
                        accumulator: accumulator.clone(),
                    });
                }
            }
        }
        results.sort_by_key(|r| (r.duration, r.window_start, r.metric_name.clone()));
        results
    }

    /// Spawns a background task that periodically trims every duration's
    /// window list down to `max_windows_per_duration`, for durations that
    /// have gone quiet and so never trigger the insert-time eviction in
    /// [`Self::record`].
    pub fn start_rotation(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.rotation_check_interval);
            loop {
                ticker.tick().await;
                let mut buckets = self.buckets.lock();
                for windows in buckets.values_mut() {
                    Self::evict_overflow(windows, self.config.max_windows_per_duration);
                }
            }
        })
    }
}

/// Simple glob matching: `*` matches any run of characters, everything else
/// must match literally. Sufficient for metric-name prefix/suffix queries
/// without pulling in a full regex engine.
fn pattern_matches(pattern: &str, name: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == name;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut rest = name;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !rest.starts_with(part) {
                return false;
            }
            rest = &rest[part.len()..];
        } else if i == parts.len() - 1 {
            if !rest.ends_with(part) {
                return false;
            }
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(window_duration: Duration, max_windows: usize) -> TimeWindowManagerConfig {
        let mut window_durations = BTreeSet::new();
        window_durations.insert(window_duration);
        TimeWindowManagerConfig {
            window_durations,
            max_windows_per_duration: max_windows,
            rotation_check_interval: Duration::from_secs(30),
        }
    }

    #[test]
    fn points_in_the_same_aligned_interval_share_a_window() {
        let duration = Duration::from_secs(10);
        let manager = TimeWindowManager::new(config(duration, 10));
        let base = UNIX_EPOCH + Duration::from_secs(100);
        manager.record(&DataPoint::new("m", MetricKind::Counter, 1.0).with_timestamp(base));
        manager.record(
            &DataPoint::new("m", MetricKind::Counter, 1.0)
                .with_timestamp(base + Duration::from_secs(9)),
        );
        assert_eq!(manager.window_count(duration), 1);

        manager.record(
            &DataPoint::new("m", MetricKind::Counter, 1.0)
                .with_timestamp(base + Duration::from_secs(10)),
        );
        assert_eq!(manager.window_count(duration), 2);
    }

    #[test]
    fn max_windows_evicts_oldest() {
        let duration = Duration::from_secs(1);
        let manager = TimeWindowManager::new(config(duration, 2));
        for i in 0..5u64 {
            manager.record(
                &DataPoint::new("m", MetricKind::Gauge, i as f64)
                    .with_timestamp(UNIX_EPOCH + Duration::from_secs(i)),
            );
        }
        assert_eq!(manager.window_count(duration), 2);
    }

    #[test]
    fn counter_window_sums_while_gauge_window_tracks_last() {
        let duration = Duration::from_secs(60);
        let manager = TimeWindowManager::new(config(duration, 60));
        let t = UNIX_EPOCH + Duration::from_secs(5);
        manager.record(&DataPoint::new("c", MetricKind::Counter, 3.0).with_timestamp(t));
        manager.record(&DataPoint::new("c", MetricKind::Counter, 4.0).with_timestamp(t));
        manager.record(&DataPoint::new("g", MetricKind::Gauge, 1.0).with_timestamp(t));
        manager.record(&DataPoint::new("g", MetricKind::Gauge, 9.0).with_timestamp(t));

        let snapshot = manager.snapshot(duration);
        let (_, accumulators) = snapshot.into_iter().next().unwrap();
        assert_eq!(accumulators["c"].representative_value(), 7.0);
        assert_eq!(accumulators["g"].representative_value(), 9.0);
    }

    /// §4.10: the same point is assigned to a window for *every* configured
    /// duration, not just one.
    #[test]
    fn a_point_is_assigned_to_a_window_for_each_configured_duration() {
        let mut window_durations = BTreeSet::new();
        window_durations.insert(Duration::from_secs(60));
        window_durations.insert(Duration::from_secs(300));
        let manager = TimeWindowManager::new(TimeWindowManagerConfig {
            window_durations,
            max_windows_per_duration: 10,
            rotation_check_interval: Duration::from_secs(30),
        });
        manager.record(&DataPoint::new("m", MetricKind::Counter, 1.0));
        assert_eq!(manager.window_count(Duration::from_secs(60)), 1);
        assert_eq!(manager.window_count(Duration::from_secs(300)), 1);
    }

    /// S6-style query: filter by name pattern, a duration subset, and a
    /// time range using the overlap rule.
    #[test]
    fn query_filters_by_name_pattern_duration_and_time_range() {
        let duration = Duration::from_secs(60);
        let manager = TimeWindowManager::new(config(duration, 60));
        manager.record(
            &DataPoint::new("http_requests", MetricKind::Counter, 1.0)
                .with_timestamp(UNIX_EPOCH + Duration::from_secs(0)),
        );
        manager.record(
            &DataPoint::new("http_errors", MetricKind::Counter, 1.0)
                .with_timestamp(UNIX_EPOCH + Duration::from_secs(120)),
        );

        let all = manager.query(Some("http_*"), None, None);
        assert_eq!(all.len(), 2);

        let early_only = manager.query(
            None,
            None,
            Some((UNIX_EPOCH, UNIX_EPOCH + Duration::from_secs(30))),
        );
        assert_eq!(early_only.len(), 1);
        assert_eq!(early_only[0].metric_name, "http_requests");

        let wrong_duration = manager.query(None, Some(&[Duration::from_secs(1)]), None);
        assert!(wrong_duration.is_empty());
    }

    #[test]
    fn pattern_matching_supports_prefix_suffix_and_contains_globs() {
        assert!(pattern_matches("http_*", "http_requests"));
        assert!(pattern_matches("*_total", "errors_total"));
        assert!(pattern_matches("*mid*", "command_middleware_count"));
        assert!(!pattern_matches("http_*", "grpc_requests"));
        assert!(pattern_matches("exact", "exact"));
        assert!(!pattern_matches("exact", "exactly"));
    }

    proptest::proptest! {
        /// P9: two timestamps within the same aligned `[floor(t/d)*d, +d)`
        /// interval always land in the same window, regardless of how far
        /// apart they are within that interval or the order they arrive in.
        #[test]
        fn timestamps_in_the_same_aligned_interval_always_share_a_window(
            base_secs in 0u64..1_000_000,
            duration_secs in 1u64..3600,
            offset_millis in 0u64..3_600_000,
        ) {
            let duration = Duration::from_secs(duration_secs);
            let aligned_base = (base_secs / duration_secs) * duration_secs;
            let offset = Duration::from_millis(offset_millis % (duration_secs * 1000));

            let t1 = UNIX_EPOCH + Duration::from_secs(aligned_base);
            let t2 = UNIX_EPOCH + Duration::from_secs(aligned_base) + offset;

            let index1 = TimeWindowManager::window_index(duration, t1);
            let index2 = TimeWindowManager::window_index(duration, t2);
            prop_assert_eq!(index1, index2);
        }
    }
}
