//! The wire/record-level shape of a single metric observation.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Timer,
}

/// One observation recorded by a producer. `tags` is a `BTreeMap` rather
/// than a `HashMap` so that exported output (and test assertions) have a
/// deterministic key order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
    pub timestamp: SystemTime,
    pub tags: BTreeMap<String, String>,
    pub unit: Option<String>,
}

impl DataPoint {
    pub fn new(name: impl Into<String>, kind: MetricKind, value: f64) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
            timestamp: SystemTime::now(),
            tags: BTreeMap::new(),
            unit: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

/// The external wire contract (§6): `{name, type, value, timestamp_ms_unix,
/// tags, unit}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    pub value: f64,
    pub timestamp_ms_unix: u64,
    pub tags: BTreeMap<String, String>,
    pub unit: Option<String>,
}

impl From<&DataPoint> for Snapshot {
    fn from(point: &DataPoint) -> Self {
        let timestamp_ms_unix = point
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64;
        Self {
            name: point.name.clone(),
            kind: point.kind,
            value: point.value,
            timestamp_ms_unix,
            tags: point.tags.clone(),
            unit: point.unit.clone(),
        }
    }
}
