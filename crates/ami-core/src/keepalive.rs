//! Keepalive ticker
//!
//! Pings the server through the correlator once per interval and gives each
//! ping one interval to be answered. A failed or late ping closes the session,
//! which ends the read loop and sends the reconnect loop around again. The
//! ticker runs on its own task so a busy event stream cannot starve it.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::correlator::ActionCorrelator;
use crate::message::Action;
use crate::transport::Session;

/// Running keepalive task; stopped on [`stop`](Self::stop) or drop
#[derive(Debug)]
pub struct KeepAlive {
    handle: Option<JoinHandle<()>>,
}

impl KeepAlive {
    pub fn start(
        session: Arc<Session>,
        correlator: Arc<ActionCorrelator>,
        interval: Duration,
    ) -> Self {
        let handle = tokio::spawn(keepalive_loop(session, correlator, interval));
        Self {
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("Keepalive stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn keepalive_loop(
    session: Arc<Session>,
    correlator: Arc<ActionCorrelator>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the session was just verified by login.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if session.is_closed() {
            return;
        }

        match correlator.execute(&*session, &Action::ping(), interval).await {
            Ok(response) => {
                trace!(status = response.status(), "Keepalive answered");
            }
            Err(e) => {
                warn!(
                    address = session.address(),
                    error = %e,
                    "Keepalive failed, declaring session dead"
                );
                session.close(&format!("keepalive failed: {}", e));
                return;
            }
        }
    }
}
