//! Action/response correlation
//!
//! Every outgoing action gets a process-unique `ActionID`. The id keys a table
//! of waiting callers; the read loop resolves entries as responses arrive and
//! the caller suspends on a oneshot receiver with a mandatory deadline. The
//! table lock is never held across an await point.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{AmiError, AmiResult};
use crate::message::{Action, Fields, Response};

/// Anything that can put a block on the wire
#[async_trait]
pub trait BlockSink: Send + Sync {
    async fn send_block(&self, fields: &Fields) -> AmiResult<()>;
}

type PendingTable = Arc<Mutex<HashMap<String, PendingEntry>>>;

/// Handle for one outstanding action
///
/// Dropping the handle before a verdict arrives unregisters the action, so a
/// caller that gives up early leaves nothing behind in the table.
#[derive(Debug)]
pub struct PendingAction {
    action_id: String,
    action: String,
    rx: oneshot::Receiver<AmiResult<Response>>,
    table: PendingTable,
    settled: bool,
}

impl PendingAction {
    pub fn action_id(&self) -> &str {
        &self.action_id
    }

    pub fn action(&self) -> &str {
        &self.action
    }
}

impl Drop for PendingAction {
    fn drop(&mut self) {
        if !self.settled && self.table.lock().remove(&self.action_id).is_some() {
            trace!(action = %self.action, action_id = %self.action_id, "Abandoned pending action");
        }
    }
}

#[derive(Debug)]
struct PendingEntry {
    action: String,
    sent_at: Instant,
    tx: oneshot::Sender<AmiResult<Response>>,
}

/// Snapshot of an outstanding action for introspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingActionInfo {
    pub action_id: String,
    pub action: String,
    pub age: Duration,
}

/// Table of actions awaiting a response
#[derive(Debug)]
pub struct ActionCorrelator {
    next_id: AtomicU64,
    pending: PendingTable,
}

impl Default for ActionCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionCorrelator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Allocate the next correlation id without registering anything
    pub fn next_action_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Assign an id to `action` and register a waiter for it
    ///
    /// Returns the wire fields (with `ActionID` inserted) and the handle to
    /// wait on.
    pub fn register(&self, action: &Action) -> (Fields, PendingAction) {
        let action_id = self.next_action_id();
        let (tx, rx) = oneshot::channel();

        self.pending.lock().insert(
            action_id.clone(),
            PendingEntry {
                action: action.name().to_string(),
                sent_at: Instant::now(),
                tx,
            },
        );
        trace!(action = action.name(), action_id = %action_id, "Registered pending action");

        let fields = action.to_fields(&action_id);
        let pending = PendingAction {
            action_id,
            action: action.name().to_string(),
            rx,
            table: self.pending.clone(),
            settled: false,
        };
        (fields, pending)
    }

    /// Hand a response to the caller waiting on its `ActionID`
    ///
    /// Returns `false` when nobody is waiting (no id, unknown id, or the
    /// caller already timed out).
    pub fn resolve(&self, response: Response) -> bool {
        let Some(action_id) = response.action_id().map(str::to_owned) else {
            debug!(status = response.status(), "Dropping response without ActionID");
            return false;
        };

        let entry = self.pending.lock().remove(&action_id);
        match entry {
            Some(entry) => {
                trace!(
                    action = %entry.action,
                    action_id = %action_id,
                    elapsed_ms = entry.sent_at.elapsed().as_millis() as u64,
                    "Resolved pending action"
                );
                // The caller may have stopped waiting; nothing to do then.
                let _ = entry.tx.send(Ok(response));
                true
            }
            None => {
                debug!(action_id = %action_id, "Dropping response for unknown ActionID");
                false
            }
        }
    }

    /// Suspend until the response arrives or `timeout` elapses
    ///
    /// If the returned future is dropped first, the entry is removed along
    /// with the handle.
    pub async fn wait(&self, mut pending: PendingAction, timeout: Duration) -> AmiResult<Response> {
        let outcome = tokio::time::timeout(timeout, &mut pending.rx).await;
        match outcome {
            Ok(Ok(result)) => {
                pending.settled = true;
                result
            }
            // Sender dropped without a verdict: the table was torn down.
            Ok(Err(_)) => {
                pending.settled = true;
                Err(AmiError::connection_lost("pending action table dropped"))
            }
            Err(_) => {
                self.pending.lock().remove(&pending.action_id);
                pending.settled = true;
                warn!(
                    action = %pending.action,
                    action_id = %pending.action_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Action timed out"
                );
                Err(AmiError::action_timeout(
                    pending.action.clone(),
                    pending.action_id.clone(),
                    timeout,
                ))
            }
        }
    }

    /// Register, send and wait in one step
    pub async fn execute(
        &self,
        sink: &dyn BlockSink,
        action: &Action,
        timeout: Duration,
    ) -> AmiResult<Response> {
        let (fields, pending) = self.register(action);
        // On a send failure the dropped handle unregisters the entry.
        sink.send_block(&fields).await?;
        self.wait(pending, timeout).await
    }

    /// Resolve every outstanding entry with `ConnectionLost`
    ///
    /// Returns the number of entries failed.
    pub fn fail_all_pending(&self, reason: &str) -> usize {
        let drained: Vec<(String, PendingEntry)> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (action_id, entry) in drained {
            trace!(action = %entry.action, action_id = %action_id, "Failing pending action");
            let _ = entry.tx.send(Err(AmiError::connection_lost(reason)));
        }
        if count > 0 {
            debug!(count, reason, "Failed all pending actions");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Outstanding actions ordered by id
    pub fn pending_snapshot(&self) -> Vec<PendingActionInfo> {
        let mut snapshot: Vec<PendingActionInfo> = self
            .pending
            .lock()
            .iter()
            .map(|(id, entry)| PendingActionInfo {
                action_id: id.clone(),
                action: entry.action.clone(),
                age: entry.sent_at.elapsed(),
            })
            .collect();
        snapshot.sort_by_key(|info| info.action_id.parse::<u64>().unwrap_or(u64::MAX));
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn success(action_id: &str) -> Response {
        Response::new(
            Fields::new()
                .with("Response", "Success")
                .with("ActionID", action_id),
        )
    }

    struct FailingSink;

    #[async_trait]
    impl BlockSink for FailingSink {
        async fn send_block(&self, _fields: &Fields) -> AmiResult<()> {
            Err(AmiError::connection("broken pipe"))
        }
    }

    #[test]
    fn test_ids_are_monotonic() {
        let correlator = ActionCorrelator::new();
        let a: u64 = correlator.next_action_id().parse().unwrap();
        let b: u64 = correlator.next_action_id().parse().unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_resolve_wakes_waiter() {
        let correlator = Arc::new(ActionCorrelator::new());
        let (fields, pending) = correlator.register(&Action::ping());
        let id = fields.get("ActionID").unwrap().to_string();
        assert_eq!(correlator.pending_count(), 1);

        let resolver = correlator.clone();
        let id_clone = id.clone();
        tokio::spawn(async move {
            assert!(resolver.resolve(success(&id_clone)));
        });

        let response = correlator
            .wait(pending, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.action_id(), Some(id.as_str()));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry() {
        let correlator = ActionCorrelator::new();
        let (_, pending) = correlator.register(&Action::ping());
        let id = pending.action_id().to_string();

        let result = correlator.wait(pending, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(AmiError::ActionTimeout { .. })));
        assert_eq!(correlator.pending_count(), 0);

        // A late response finds nobody waiting.
        assert!(!correlator.resolve(success(&id)));
    }

    #[tokio::test]
    async fn test_fail_all_pending() {
        let correlator = Arc::new(ActionCorrelator::new());
        let mut waiters = Vec::new();
        for _ in 0..5 {
            let (_, pending) = correlator.register(&Action::ping());
            let c = correlator.clone();
            waiters.push(tokio::spawn(async move {
                c.wait(pending, Duration::from_secs(30)).await
            }));
        }
        assert_eq!(correlator.pending_count(), 5);

        assert_eq!(correlator.fail_all_pending("socket closed"), 5);
        assert_eq!(correlator.pending_count(), 0);

        for waiter in waiters {
            let result = waiter.await.unwrap();
            assert!(matches!(result, Err(AmiError::ConnectionLost { .. })));
        }
    }

    #[tokio::test]
    async fn test_send_failure_cancels_entry() {
        let correlator = ActionCorrelator::new();
        let result = correlator
            .execute(&FailingSink, &Action::ping(), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(AmiError::Connection { .. })));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_waiters_leave_no_entries() {
        let correlator = Arc::new(ActionCorrelator::new());
        for _ in 0..100 {
            let (_, pending) = correlator.register(&Action::ping());
            let waited = tokio::time::timeout(
                Duration::from_millis(1),
                correlator.wait(pending, Duration::from_secs(30)),
            )
            .await;
            assert!(waited.is_err());
        }
        assert_eq!(correlator.pending_count(), 0);

        // An aborted task drops its handle too.
        let (_, pending) = correlator.register(&Action::ping());
        let c = correlator.clone();
        let task = tokio::spawn(async move { c.wait(pending, Duration::from_secs(30)).await });
        tokio::task::yield_now().await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_dropped_handle_unregisters() {
        let correlator = ActionCorrelator::new();
        let (fields, pending) = correlator.register(&Action::ping());
        assert_eq!(correlator.pending_count(), 1);
        drop(pending);
        assert_eq!(correlator.pending_count(), 0);
        let id = fields.get("ActionID").unwrap();
        assert!(!correlator.resolve(success(id)));
    }

    #[test]
    fn test_response_without_id_is_dropped() {
        let correlator = ActionCorrelator::new();
        let (_fields, _pending) = correlator.register(&Action::ping());
        let orphan = Response::new(Fields::new().with("Response", "Success"));
        assert!(!correlator.resolve(orphan));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[test]
    fn test_pending_snapshot_sorted() {
        let correlator = ActionCorrelator::new();
        let _handles: Vec<_> = ["Ping", "Status", "CoreStatus"]
            .into_iter()
            .map(|name| correlator.register(&Action::new(name)))
            .collect();
        let names: Vec<_> = correlator
            .pending_snapshot()
            .into_iter()
            .map(|info| info.action)
            .collect();
        assert_eq!(names, vec!["Ping", "Status", "CoreStatus"]);
    }
}
