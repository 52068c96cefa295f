//! Event dispatch
//!
//! The read loop hands every decoded block to [`EventDispatcher::dispatch`].
//! Responses go to the [`ActionCorrelator`]; events go to the handler
//! registered for their name. Dispatch is synchronous and runs on the read
//! loop, so events of one session reach handlers strictly in arrival order.
//! Nothing is reordered, buffered or deduplicated here.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::correlator::ActionCorrelator;
use crate::message::{Event, Fields, Message};

/// Receives events of the names it was registered for
///
/// Handlers run on the read loop and must not block. Work that needs to
/// issue actions should be spawned onto its own task.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn handle_event(&self, event: &Event) {
        self(event)
    }
}

/// Routes classified blocks to the correlator or to event handlers
pub struct EventDispatcher {
    correlator: Arc<ActionCorrelator>,
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
    unhandled_handler: RwLock<Option<Arc<dyn EventHandler>>>,
    dispatched: AtomicU64,
    unhandled: AtomicU64,
    unclassified: AtomicU64,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.registered_events())
            .field("dispatched", &self.dispatched_count())
            .field("unhandled", &self.unhandled_count())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new(correlator: Arc<ActionCorrelator>) -> Self {
        Self {
            correlator,
            handlers: RwLock::new(HashMap::new()),
            unhandled_handler: RwLock::new(None),
            dispatched: AtomicU64::new(0),
            unhandled: AtomicU64::new(0),
            unclassified: AtomicU64::new(0),
        }
    }

    /// Bind `handler` to an event name (case-insensitive)
    ///
    /// A later registration for the same name replaces the earlier one.
    pub fn register_handler(&self, event_name: &str, handler: Arc<dyn EventHandler>) {
        let key = event_name.to_ascii_lowercase();
        if self.handlers.write().insert(key, handler).is_some() {
            warn!(event = event_name, "Replaced existing event handler");
        } else {
            debug!(event = event_name, "Registered event handler");
        }
    }

    /// Receives events that have no registered handler, after they are counted
    pub fn set_unhandled_handler(&self, handler: Arc<dyn EventHandler>) {
        *self.unhandled_handler.write() = Some(handler);
    }

    /// Names with a registered handler, sorted
    pub fn registered_events(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Classify one decoded block and route it
    pub fn dispatch(&self, fields: Fields) {
        match Message::classify(fields) {
            Message::Response(response) => {
                self.correlator.resolve(response);
            }
            Message::Event(event) => self.dispatch_event(&event),
            Message::Unknown(fields) => {
                self.unclassified.fetch_add(1, Ordering::Relaxed);
                debug!(fields = %fields, "Dropping block that is neither event nor response");
            }
        }
    }

    fn dispatch_event(&self, event: &Event) {
        // Clone the handler out so no lock is held while it runs.
        let handler = self
            .handlers
            .read()
            .get(&event.name().to_ascii_lowercase())
            .cloned();

        match handler {
            Some(handler) => {
                self.dispatched.fetch_add(1, Ordering::Relaxed);
                trace!(event = event.name(), "Dispatching event");
                handler.handle_event(event);
            }
            None => {
                self.unhandled.fetch_add(1, Ordering::Relaxed);
                trace!(event = event.name(), "No handler registered for event");
                let fallback = self.unhandled_handler.read().clone();
                if let Some(fallback) = fallback {
                    fallback.handle_event(event);
                }
            }
        }
    }

    /// Events delivered to a registered handler
    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Events dropped for lack of a handler
    pub fn unhandled_count(&self) -> u64 {
        self.unhandled.load(Ordering::Relaxed)
    }

    /// Blocks that were neither an event nor a response
    pub fn unclassified_count(&self) -> u64 {
        self.unclassified.load(Ordering::Relaxed)
    }
}
