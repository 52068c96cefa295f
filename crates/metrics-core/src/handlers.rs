//! Bindings from manager interface events to tracker operations
//!
//! | Event               | Alias              | Operation                        |
//! |---------------------|--------------------|----------------------------------|
//! | `Newchannel`        | `Call-Start`       | [`CallTracker::call_started`]    |
//! | `Newstate`          | `State-Change`     | [`CallTracker::state_changed`]   |
//! | `SoftHangupRequest` | `Hangup-Requested` | [`CallTracker::hangup_requested`]|
//! | `Hangup`            | `Call-End`         | [`CallTracker::call_ended`]      |

use std::sync::Arc;

use tracing::warn;

use amistat_ami_core::{Event, EventDispatcher, EventHandler};

use crate::sink::MetricsSink;
use crate::tracker::CallTracker;

pub const EVENTS_UNHANDLED: &str = "ami.events.unhandled";

const UNIQUEID: &str = "Uniqueid";
const CHANNEL: &str = "Channel";
const CHANNEL_STATE_DESC: &str = "ChannelStateDesc";
const CHANNEL_STATE: &str = "ChannelState";
const CAUSE: &str = "Cause";

/// Call lifecycle step an event stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallEventKind {
    Start,
    StateChange,
    HangupRequested,
    End,
}

impl CallEventKind {
    pub const ALL: [CallEventKind; 4] = [
        CallEventKind::Start,
        CallEventKind::StateChange,
        CallEventKind::HangupRequested,
        CallEventKind::End,
    ];

    /// Event names bound to this kind: the manager interface name, then the alias
    pub fn event_names(self) -> [&'static str; 2] {
        match self {
            CallEventKind::Start => ["Newchannel", "Call-Start"],
            CallEventKind::StateChange => ["Newstate", "State-Change"],
            CallEventKind::HangupRequested => ["SoftHangupRequest", "Hangup-Requested"],
            CallEventKind::End => ["Hangup", "Call-End"],
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| {
            kind.event_names()
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(name))
        })
    }
}

/// Applies one kind of call event to the tracker
#[derive(Debug, Clone)]
pub struct CallEventHandler {
    kind: CallEventKind,
    tracker: Arc<CallTracker>,
}

impl CallEventHandler {
    pub fn new(kind: CallEventKind, tracker: Arc<CallTracker>) -> Self {
        Self { kind, tracker }
    }

    pub fn kind(&self) -> CallEventKind {
        self.kind
    }
}

impl EventHandler for CallEventHandler {
    fn handle_event(&self, event: &Event) {
        let Some(uniqueid) = event.get(UNIQUEID).filter(|id| !id.is_empty()) else {
            warn!(event = event.name(), "Call event without Uniqueid ignored");
            return;
        };

        match self.kind {
            CallEventKind::Start => {
                let channel = event.get(CHANNEL).unwrap_or_default();
                self.tracker.call_started(uniqueid, channel);
            }
            CallEventKind::StateChange => {
                let state = event
                    .get(CHANNEL_STATE_DESC)
                    .or_else(|| event.get(CHANNEL_STATE))
                    .unwrap_or("unknown");
                self.tracker.state_changed(uniqueid, state);
            }
            CallEventKind::HangupRequested => {
                self.tracker.hangup_requested(uniqueid);
            }
            CallEventKind::End => {
                let cause = event.get(CAUSE).filter(|c| !c.is_empty());
                self.tracker.call_ended(uniqueid, cause);
            }
        }
    }
}

/// Counts events no handler was registered for
#[derive(Debug, Clone)]
pub struct UnhandledEventCounter {
    sink: Arc<dyn MetricsSink>,
}

impl UnhandledEventCounter {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }
}

impl EventHandler for UnhandledEventCounter {
    fn handle_event(&self, _event: &Event) {
        self.sink.incr(EVENTS_UNHANDLED);
    }
}

/// Bind every call event name, and the unhandled counter, on `dispatcher`
pub fn register_call_handlers(
    dispatcher: &EventDispatcher,
    tracker: Arc<CallTracker>,
    sink: Arc<dyn MetricsSink>,
) {
    for kind in CallEventKind::ALL {
        let handler: Arc<dyn EventHandler> = Arc::new(CallEventHandler::new(kind, tracker.clone()));
        for name in kind.event_names() {
            dispatcher.register_handler(name, handler.clone());
        }
    }
    dispatcher.set_unhandled_handler(Arc::new(UnhandledEventCounter::new(sink)));
}
