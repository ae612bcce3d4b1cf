//! A bounded, oldest-drop ring buffer of recent `DataPoint`s, one per
//! metric name, used for streaming/introspection between collection and
//! window aggregation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::datapoint::DataPoint;

pub struct MetricBuffer {
    capacity: usize,
    items: Mutex<VecDeque<DataPoint>>,
    dropped: AtomicU64,
}

impl MetricBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Pushes a point, evicting the oldest entry if the buffer is full.
    pub fn push(&self, point: DataPoint) {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            items.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        items.push_back(point);
    }

    pub fn drain(&self) -> Vec<DataPoint> {
        self.items.lock().drain(..).collect()
    }

    /// Drains at most `n` points, oldest first, atomically with respect to
    /// concurrent `push`. Used by the collector's batched collection loop
    /// (§4.9) instead of draining the whole buffer at once.
    pub fn drain_up_to(&self, n: usize) -> Vec<DataPoint> {
        let mut items = self.items.lock();
        let take = n.min(items.len());
        items.drain(..take).collect()
    }

    pub fn snapshot(&self) -> Vec<DataPoint> {
        self.items.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapoint::MetricKind;

    #[test]
    fn overflow_drops_oldest_not_newest() {
        let buffer = MetricBuffer::new(2);
        buffer.push(DataPoint::new("m", MetricKind::Counter, 1.0));
        buffer.push(DataPoint::new("m", MetricKind::Counter, 2.0));
        buffer.push(DataPoint::new("m", MetricKind::Counter, 3.0));

        let snapshot = buffer.snapshot();
        let values: Vec<f64> = snapshot.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![2.0, 3.0]);
        assert_eq!(buffer.dropped_count(), 1);
    }

    #[test]
    fn drain_up_to_takes_only_the_requested_count_oldest_first() {
        let buffer = MetricBuffer::new(10);
        for i in 0..5 {
            buffer.push(DataPoint::new("m", MetricKind::Counter, i as f64));
        }
        let first_batch = buffer.drain_up_to(3);
        assert_eq!(
            first_batch.iter().map(|p| p.value).collect::<Vec<_>>(),
            vec![0.0, 1.0, 2.0]
        );
        assert_eq!(buffer.len(), 2);
        let rest = buffer.drain_up_to(10);
        assert_eq!(rest.len(), 2);
        assert!(buffer.is_empty());
    }
}
