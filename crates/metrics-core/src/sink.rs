//! Metrics sink capability
//!
//! Everything above this layer talks to a `dyn MetricsSink`. Sinks are
//! fire-and-forget: none of the methods can fail, and tracker behaviour is the
//! same whichever sink is plugged in.

use std::fmt;

use parking_lot::Mutex;

/// Counters, gauges and timings addressed by metric name
pub trait MetricsSink: Send + Sync + fmt::Debug {
    fn incr(&self, name: &str);

    fn set_gauge(&self, name: &str, value: i64);

    fn incr_gauge(&self, name: &str);

    fn decr_gauge(&self, name: &str);

    /// Record a duration in milliseconds
    fn timing(&self, name: &str, millis: u64);
}

/// Discards everything; used when no backend is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn incr(&self, _name: &str) {}

    fn set_gauge(&self, _name: &str, _value: i64) {}

    fn incr_gauge(&self, _name: &str) {}

    fn decr_gauge(&self, _name: &str) {}

    fn timing(&self, _name: &str, _millis: u64) {}
}

/// One call made on a [`MemorySink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricRecord {
    Counter { name: String },
    Gauge { name: String, value: i64 },
    GaugeDelta { name: String, delta: i64 },
    Timing { name: String, millis: u64 },
}

impl MetricRecord {
    pub fn name(&self) -> &str {
        match self {
            MetricRecord::Counter { name }
            | MetricRecord::Gauge { name, .. }
            | MetricRecord::GaugeDelta { name, .. }
            | MetricRecord::Timing { name, .. } => name,
        }
    }
}

/// Keeps every emitted metric in order, for inspection
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<MetricRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MetricRecord> {
        self.records.lock().clone()
    }

    /// Number of increments of counter `name`
    pub fn counter(&self, name: &str) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| matches!(r, MetricRecord::Counter { name: n } if n == name))
            .count()
    }

    /// Values `name` was set to, oldest first
    pub fn gauge_values(&self, name: &str) -> Vec<i64> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                MetricRecord::Gauge { name: n, value } if n == name => Some(*value),
                _ => None,
            })
            .collect()
    }

    pub fn timings(&self, name: &str) -> Vec<u64> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                MetricRecord::Timing { name: n, millis } if n == name => Some(*millis),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    fn push(&self, record: MetricRecord) {
        self.records.lock().push(record);
    }
}

impl MetricsSink for MemorySink {
    fn incr(&self, name: &str) {
        self.push(MetricRecord::Counter {
            name: name.to_string(),
        });
    }

    fn set_gauge(&self, name: &str, value: i64) {
        self.push(MetricRecord::Gauge {
            name: name.to_string(),
            value,
        });
    }

    fn incr_gauge(&self, name: &str) {
        self.push(MetricRecord::GaugeDelta {
            name: name.to_string(),
            delta: 1,
        });
    }

    fn decr_gauge(&self, name: &str) {
        self.push(MetricRecord::GaugeDelta {
            name: name.to_string(),
            delta: -1,
        });
    }

    fn timing(&self, name: &str, millis: u64) {
        self.push(MetricRecord::Timing {
            name: name.to_string(),
            millis,
        });
    }
}

/// Turn free text (a channel state, a cause code) into one metric name segment
pub fn metric_segment(raw: &str) -> String {
    let segment: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if segment.is_empty() {
        "unknown".to_string()
    } else {
        segment
    }
}
