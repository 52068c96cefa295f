//! Event-to-metric translation for amistat
//!
//! The [`CallTracker`] follows each call from its start event to its end event
//! and derives counters, the active-call gauge and call durations from the
//! transitions. Output goes through a [`MetricsSink`]: [`StatsdSink`] in
//! production, [`NoopSink`] when no collector is configured, [`MemorySink`]
//! for inspection.
//!
//! ```rust
//! use std::sync::Arc;
//! use amistat_metrics_core::{CallTracker, GaugeStore, MemorySink};
//!
//! let sink = Arc::new(MemorySink::new());
//! let gauges = Arc::new(GaugeStore::new(sink.clone()));
//! let tracker = CallTracker::new(sink.clone(), gauges.clone());
//!
//! tracker.call_started("1700000000.1", "SIP/100-00000001");
//! tracker.call_ended("1700000000.1", Some("16"));
//!
//! assert_eq!(sink.counter("calls.ended"), 1);
//! assert_eq!(gauges.get("calls.active"), Some(0));
//! ```

pub mod error;
pub mod gauges;
pub mod handlers;
pub mod sink;
pub mod statsd;
pub mod tracker;

pub use error::{MetricsError, MetricsResult};
pub use gauges::GaugeStore;
pub use handlers::{CallEventHandler, CallEventKind, UnhandledEventCounter, register_call_handlers};
pub use sink::{MemorySink, MetricRecord, MetricsSink, NoopSink, metric_segment};
pub use statsd::{DEFAULT_STATSD_PORT, StatsdConfig, StatsdSink};
pub use tracker::{CallTracker, PendingCall, PendingCallInfo};
