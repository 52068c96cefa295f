//! Gauge store
//!
//! Keeps the last value of every gauge so it can be read back for
//! introspection, and forwards each change to the sink. One store per
//! process in production; tests build their own.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::sink::MetricsSink;

pub struct GaugeStore {
    values: Mutex<BTreeMap<String, i64>>,
    sink: Arc<dyn MetricsSink>,
}

impl fmt::Debug for GaugeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GaugeStore")
            .field("values", &*self.values.lock())
            .finish()
    }
}

impl GaugeStore {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            values: Mutex::new(BTreeMap::new()),
            sink,
        }
    }

    /// Store and forward an absolute value
    ///
    /// The sink is written while the store is locked so concurrent setters
    /// reach it in the order their values were stored.
    pub fn set(&self, name: &str, value: i64) {
        let mut values = self.values.lock();
        values.insert(name.to_string(), value);
        self.sink.set_gauge(name, value);
    }

    /// Add one and return the new value
    pub fn incr(&self, name: &str) -> i64 {
        let value = {
            let mut values = self.values.lock();
            let entry = values.entry(name.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        self.sink.incr_gauge(name);
        value
    }

    /// Subtract one and return the new value
    pub fn decr(&self, name: &str) -> i64 {
        let value = {
            let mut values = self.values.lock();
            let entry = values.entry(name.to_string()).or_insert(0);
            *entry -= 1;
            *entry
        };
        self.sink.decr_gauge(name);
        value
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.values.lock().get(name).copied()
    }

    /// Consistent copy of every gauge, sorted by name
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.values.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}
