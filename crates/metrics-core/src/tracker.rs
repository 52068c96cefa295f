//! Call-state tracker
//!
//! Keeps one [`PendingCall`] per call identifier between the call's start and
//! end events and turns the transitions into metrics. The event stream is
//! lossy: a reconnect can drop the start or the end of any call, so every
//! operation tolerates unknown identifiers and duplicates.
//!
//! Entries opened before a reconnect stay in the table until their end event
//! is seen or the process restarts. There is no sweep.
//!
//! Lock order is always the call table, then the gauge store. The
//! `calls.active` gauge is set while the table is still locked, so it always
//! reflects the table size that produced it.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::gauges::GaugeStore;
use crate::sink::{MetricsSink, metric_segment};

pub const CALLS_STARTED: &str = "calls.started";
pub const CALLS_ACTIVE: &str = "calls.active";
pub const CALLS_ENDED: &str = "calls.ended";
pub const CALLS_DURATION: &str = "calls.duration";
pub const CALLS_STATE_PREFIX: &str = "calls.state";
pub const CALLS_ENDED_CAUSE_PREFIX: &str = "calls.ended.cause";

/// A call seen starting and not yet seen ending
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub channel: String,
    pub state: Option<String>,
    pub hangup_requested: bool,
    pub created_at: Instant,
    pub created_wall: DateTime<Utc>,
}

impl PendingCall {
    fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            state: None,
            hangup_requested: false,
            created_at: Instant::now(),
            created_wall: Utc::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Read-only view of one table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCallInfo {
    pub uniqueid: String,
    pub channel: String,
    pub state: Option<String>,
    pub hangup_requested: bool,
    pub age: Duration,
    pub started_at: DateTime<Utc>,
}

pub struct CallTracker {
    calls: Mutex<HashMap<String, PendingCall>>,
    sink: Arc<dyn MetricsSink>,
    gauges: Arc<GaugeStore>,
}

impl fmt::Debug for CallTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallTracker")
            .field("pending_calls", &self.pending_call_count())
            .finish()
    }
}

impl CallTracker {
    pub fn new(sink: Arc<dyn MetricsSink>, gauges: Arc<GaugeStore>) -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            sink,
            gauges,
        }
    }

    pub fn gauges(&self) -> &Arc<GaugeStore> {
        &self.gauges
    }

    /// Open an entry for `uniqueid`, replacing any existing one
    pub fn call_started(&self, uniqueid: &str, channel: &str) {
        let mut calls = self.calls.lock();
        let replaced = calls
            .insert(uniqueid.to_string(), PendingCall::new(channel))
            .is_some();
        self.sink.incr(CALLS_STARTED);
        self.gauges.set(CALLS_ACTIVE, calls.len() as i64);
        drop(calls);

        if replaced {
            debug!(uniqueid, channel, "Duplicate call start, entry replaced");
        } else {
            trace!(uniqueid, channel, "Call started");
        }
    }

    /// Record a new channel state; unknown calls are ignored
    ///
    /// Returns whether an entry was updated.
    pub fn state_changed(&self, uniqueid: &str, state: &str) -> bool {
        let updated = match self.calls.lock().get_mut(uniqueid) {
            Some(call) => {
                call.state = Some(state.to_string());
                true
            }
            None => false,
        };

        if updated {
            trace!(uniqueid, state, "Call state changed");
            self.sink
                .incr(&format!("{}.{}", CALLS_STATE_PREFIX, metric_segment(state)));
        } else {
            trace!(uniqueid, state, "State change for unknown call");
        }
        updated
    }

    /// Flag the call as ending; informational only
    pub fn hangup_requested(&self, uniqueid: &str) -> bool {
        match self.calls.lock().get_mut(uniqueid) {
            Some(call) => {
                call.hangup_requested = true;
                true
            }
            None => false,
        }
    }

    /// Close the entry for `uniqueid`
    ///
    /// Returns the call duration when a matching entry existed. An unknown
    /// identifier still counts as an ended call but has no duration.
    pub fn call_ended(&self, uniqueid: &str, cause: Option<&str>) -> Option<Duration> {
        let mut calls = self.calls.lock();
        let removed = calls.remove(uniqueid);

        self.sink.incr(CALLS_ENDED);
        if let Some(cause) = cause {
            self.sink.incr(&format!(
                "{}.{}",
                CALLS_ENDED_CAUSE_PREFIX,
                metric_segment(cause)
            ));
        }

        match removed {
            Some(call) => {
                let duration = call.age();
                self.sink.timing(CALLS_DURATION, duration.as_millis() as u64);
                self.gauges.set(CALLS_ACTIVE, calls.len() as i64);
                drop(calls);
                trace!(uniqueid, cause, duration_ms = duration.as_millis() as u64, "Call ended");
                Some(duration)
            }
            None => {
                drop(calls);
                debug!(uniqueid, cause, "End of a call that was never seen starting");
                None
            }
        }
    }

    pub fn pending_call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn contains(&self, uniqueid: &str) -> bool {
        self.calls.lock().contains_key(uniqueid)
    }

    /// Entries sorted oldest first
    pub fn pending_calls(&self) -> Vec<PendingCallInfo> {
        let mut entries: Vec<(Instant, PendingCallInfo)> = self
            .calls
            .lock()
            .iter()
            .map(|(id, call)| {
                (
                    call.created_at,
                    PendingCallInfo {
                        uniqueid: id.clone(),
                        channel: call.channel.clone(),
                        state: call.state.clone(),
                        hangup_requested: call.hangup_requested,
                        age: call.age(),
                        started_at: call.created_wall,
                    },
                )
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.uniqueid.cmp(&b.1.uniqueid)));
        entries.into_iter().map(|(_, info)| info).collect()
    }

    /// Write the `[pending calls]` and `[gauges]` dump sections
    pub fn dump(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "[pending calls]")?;
        for call in self.pending_calls() {
            writeln!(
                out,
                "{}: channel={} state={} ending={} age_ms={} started={}",
                call.uniqueid,
                call.channel,
                call.state.as_deref().unwrap_or("-"),
                call.hangup_requested,
                call.age.as_millis(),
                call.started_at.to_rfc3339_opts(SecondsFormat::Millis, true)
            )?;
        }
        writeln!(out)?;

        writeln!(out, "[gauges]")?;
        for (name, value) in self.gauges.snapshot() {
            writeln!(out, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;

    fn tracker() -> (Arc<MemorySink>, CallTracker) {
        let sink = Arc::new(MemorySink::new());
        let gauges = Arc::new(GaugeStore::new(sink.clone()));
        (sink.clone(), CallTracker::new(sink, gauges))
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_call_lifecycle() {
        let (sink, tracker) = tracker();

        tracker.call_started("42", "SIP/a-0001");
        assert_eq!(tracker.gauges().get(CALLS_ACTIVE), Some(1));

        assert!(tracker.state_changed("42", "Ringing"));
        assert_eq!(tracker.gauges().get(CALLS_ACTIVE), Some(1));

        tokio::time::advance(Duration::from_millis(3000)).await;
        let duration = tracker.call_ended("42", Some("16")).unwrap();
        assert_eq!(duration.as_millis(), 3000);

        assert_eq!(sink.gauge_values(CALLS_ACTIVE), vec![1, 0]);
        assert_eq!(sink.counter(CALLS_STARTED), 1);
        assert_eq!(sink.counter(CALLS_ENDED), 1);
        assert_eq!(sink.counter("calls.state.ringing"), 1);
        assert_eq!(sink.counter("calls.ended.cause.16"), 1);
        assert_eq!(sink.timings(CALLS_DURATION), vec![3000]);
        assert_eq!(tracker.pending_call_count(), 0);
    }

    #[test]
    fn test_end_without_start_counts_but_has_no_duration() {
        let (sink, tracker) = tracker();
        assert_eq!(tracker.call_ended("99", None), None);
        assert_eq!(sink.counter(CALLS_ENDED), 1);
        assert!(sink.timings(CALLS_DURATION).is_empty());
        assert!(sink.gauge_values(CALLS_ACTIVE).is_empty());
    }

    #[test]
    fn test_duplicate_start_replaces_entry() {
        let (sink, tracker) = tracker();
        tracker.call_started("7", "SIP/a-0001");
        tracker.state_changed("7", "Up");
        tracker.call_started("7", "SIP/a-0002");

        assert_eq!(tracker.pending_call_count(), 1);
        let calls = tracker.pending_calls();
        assert_eq!(calls[0].channel, "SIP/a-0002");
        assert_eq!(calls[0].state, None);
        assert_eq!(sink.gauge_values(CALLS_ACTIVE), vec![1, 1]);
        assert_eq!(sink.counter(CALLS_STARTED), 2);
    }

    #[test]
    fn test_unknown_state_change_and_hangup_are_ignored() {
        let (sink, tracker) = tracker();
        assert!(!tracker.state_changed("1", "Ringing"));
        assert!(!tracker.hangup_requested("1"));
        assert_eq!(sink.counter("calls.state.ringing"), 0);
        assert_eq!(tracker.pending_call_count(), 0);
    }

    #[test]
    fn test_hangup_request_marks_entry() {
        let (_sink, tracker) = tracker();
        tracker.call_started("5", "PJSIP/200-01");
        assert!(tracker.hangup_requested("5"));
        assert!(tracker.pending_calls()[0].hangup_requested);
        assert!(tracker.contains("5"));
    }

    #[test]
    fn test_dump_sections() {
        let (_sink, tracker) = tracker();
        tracker.call_started("1700000000.1", "SIP/100-00000001");
        tracker.state_changed("1700000000.1", "Up");

        let mut out = Vec::new();
        tracker.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("[pending calls]"));
        assert!(text.contains("1700000000.1: channel=SIP/100-00000001 state=Up ending=false"));
        assert!(text.contains("[gauges]\ncalls.active: 1"));
        assert!(text.contains(&format!(
            "started={}",
            tracker.pending_calls()[0]
                .started_at
                .to_rfc3339_opts(SecondsFormat::Millis, true)
        )));
    }

    #[test]
    fn test_concurrent_starts_keep_gauge_in_step() {
        let (_sink, tracker) = tracker();
        let tracker = Arc::new(tracker);
        for round in 0..50 {
            let workers: Vec<_> = (0..8)
                .map(|worker| {
                    let tracker = tracker.clone();
                    std::thread::spawn(move || {
                        for n in 0..50 {
                            let id = format!("{round}-{worker}-{n}");
                            tracker.call_started(&id, "SIP/load");
                            if n % 3 == 0 {
                                tracker.call_ended(&id, None);
                            }
                        }
                    })
                })
                .collect();
            for worker in workers {
                worker.join().unwrap();
            }
            assert_eq!(
                tracker.gauges().get(CALLS_ACTIVE),
                Some(tracker.pending_call_count() as i64),
                "round {round}"
            );
        }
    }
}
