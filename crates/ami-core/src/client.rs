//! AMI client and reconnect loop
//!
//! [`AmiClient`] owns the correlator, the dispatcher and at most one live
//! [`Session`]. [`AmiClient::run`] drives the connection state machine:
//!
//! ```text
//! Idle -> Connecting -> Authenticating -> Running -> Disconnecting -> Idle
//!   \___________________ any state, on stop __________________/-> Stopped
//! ```
//!
//! A failed attempt or a lost session waits the fixed reconnect delay and
//! tries again with the same credentials. [`AmiClient::request_stop`] cuts
//! short a pending attempt or delay and closes the live session.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::AmiConfig;
use crate::correlator::ActionCorrelator;
use crate::dispatcher::{EventDispatcher, EventHandler};
use crate::error::{AmiError, AmiResult};
use crate::keepalive::KeepAlive;
use crate::message::{Action, Response};
use crate::transport::{Session, SessionReader};

const STATE_CHANNEL_CAPACITY: usize = 64;

/// Releases the run slot however `run` ends
struct RunGuard<'a> {
    client: &'a AmiClient,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let client = self.client;
        let session = client.session.lock().take();
        if let Some(session) = session {
            debug!("Reconnect loop dropped with a live session");
            session.close("reconnect loop dropped");
            client.correlator.fail_all_pending("reconnect loop dropped");
        }
        if client.state() != ConnectionState::Stopped {
            client.set_state(ConnectionState::Stopped);
        }
        client.running.store(false, Ordering::SeqCst);
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Authenticating,
    Running,
    Disconnecting,
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Running => "running",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Self-healing manager interface client
pub struct AmiClient {
    config: AmiConfig,
    correlator: Arc<ActionCorrelator>,
    dispatcher: Arc<EventDispatcher>,
    session: Mutex<Option<Arc<Session>>>,
    stop: watch::Sender<bool>,
    state: Mutex<ConnectionState>,
    state_tx: broadcast::Sender<ConnectionState>,
    running: AtomicBool,
    connect_attempts: AtomicU64,
    sessions_established: AtomicU64,
}

impl fmt::Debug for AmiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmiClient")
            .field("address", &self.config.address)
            .field("state", &self.state())
            .field("pending_actions", &self.pending_action_count())
            .finish()
    }
}

impl AmiClient {
    pub fn new(config: AmiConfig) -> Self {
        let correlator = Arc::new(ActionCorrelator::new());
        let dispatcher = Arc::new(EventDispatcher::new(correlator.clone()));
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        let (stop, _) = watch::channel(false);
        Self {
            config,
            correlator,
            dispatcher,
            session: Mutex::new(None),
            stop,
            state: Mutex::new(ConnectionState::Idle),
            state_tx,
            running: AtomicBool::new(false),
            connect_attempts: AtomicU64::new(0),
            sessions_established: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &AmiConfig {
        &self.config
    }

    pub fn correlator(&self) -> &Arc<ActionCorrelator> {
        &self.correlator
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Bind a handler to an event name; see [`EventDispatcher::register_handler`]
    pub fn register_handler(&self, event_name: &str, handler: Arc<dyn EventHandler>) {
        self.dispatcher.register_handler(event_name, handler);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Every subsequent state transition, in order
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|session| !session.is_closed())
    }

    pub fn current_session(&self) -> Option<Arc<Session>> {
        self.session.lock().clone()
    }

    pub fn pending_action_count(&self) -> usize {
        self.correlator.pending_count()
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn sessions_established(&self) -> u64 {
        self.sessions_established.load(Ordering::Relaxed)
    }

    /// Send an action on the live session and wait the configured timeout
    pub async fn send_action(&self, action: &Action) -> AmiResult<Response> {
        self.send_action_with_timeout(action, self.config.action_timeout)
            .await
    }

    pub async fn send_action_with_timeout(
        &self,
        action: &Action,
        timeout: Duration,
    ) -> AmiResult<Response> {
        let session = self.current_session().ok_or(AmiError::NotConnected)?;
        self.correlator.execute(&*session, action, timeout).await
    }

    /// Ask the reconnect loop to finish; idempotent
    pub fn request_stop(&self) {
        let first = self.stop.send_if_modified(|stop| !std::mem::replace(stop, true));
        if !first {
            return;
        }
        info!("Stop requested");
        if let Some(session) = self.current_session() {
            session.close("stop requested");
        }
    }

    pub fn should_stop(&self) -> bool {
        *self.stop.borrow()
    }

    /// Drive connect / run / reconnect cycles until a stop is requested
    ///
    /// Only one loop may run per client; a second concurrent call fails.
    /// Dropping the returned future closes the live session and releases the
    /// client for another `run`.
    pub async fn run(&self) -> AmiResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AmiError::configuration("reconnect loop already running"));
        }
        let _guard = RunGuard { client: self };
        info!(address = %self.config.address, "Starting AMI reconnect loop");

        let mut stop_rx = self.stop.subscribe();
        while !self.should_stop() {
            let attempt = tokio::select! {
                result = self.establish() => Some(result),
                _ = stop_requested(&mut stop_rx) => None,
            };
            match attempt {
                Some(Ok((session, reader))) => self.run_session(session, reader).await,
                Some(Err(e)) => {
                    warn!(
                        address = %self.config.address,
                        error = %e,
                        "AMI connection attempt failed"
                    );
                    self.set_state(ConnectionState::Idle);
                }
                None => break,
            }

            if self.should_stop() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = stop_requested(&mut stop_rx) => break,
            }
        }

        self.set_state(ConnectionState::Stopped);
        info!("stopped");
        Ok(())
    }

    /// Connect and log in, bounded by the connect timeout
    async fn establish(&self) -> AmiResult<(Arc<Session>, SessionReader)> {
        self.set_state(ConnectionState::Connecting);
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);

        let attempt = async {
            let (session, mut reader) = Session::connect(&self.config.address).await?;
            self.set_state(ConnectionState::Authenticating);
            let action_id = self.correlator.next_action_id();
            session.login(&mut reader, &action_id, &self.config).await?;
            Ok::<_, AmiError>((session, reader))
        };

        match tokio::time::timeout(self.config.connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(AmiError::connection(format!(
                "connect and login did not complete within {}ms",
                self.config.connect_timeout.as_millis()
            ))),
        }
    }

    async fn run_session(&self, session: Arc<Session>, reader: SessionReader) {
        *self.session.lock() = Some(session.clone());
        self.sessions_established.fetch_add(1, Ordering::Relaxed);
        self.set_state(ConnectionState::Running);
        info!(address = %self.config.address, "Connected to AMI");

        // A stop that raced the login has no session to close yet.
        if self.should_stop() {
            session.close("stop requested");
        }

        let mut keepalive = KeepAlive::start(
            session.clone(),
            self.correlator.clone(),
            self.config.keepalive_interval,
        );
        let read_loop = tokio::spawn(
            session
                .clone()
                .run_read_loop(reader, self.dispatcher.clone()),
        );
        let reason = match read_loop.await {
            Ok(reason) => reason,
            Err(e) => format!("read loop aborted: {}", e),
        };

        self.set_state(ConnectionState::Disconnecting);
        info!(address = %self.config.address, reason = %reason, "Connection lost");

        keepalive.stop();
        session.close(&reason);
        self.session.lock().take();
        let failed = self.correlator.fail_all_pending(&reason);
        if failed > 0 {
            debug!(failed, "Pending actions failed on disconnect");
        }
        session.shutdown(&reason).await;

        // On stop the loop moves straight from Disconnecting to Stopped.
        if !self.should_stop() {
            self.set_state(ConnectionState::Idle);
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.lock(), next);
        if previous != next {
            debug!(from = %previous, to = %next, "Connection state changed");
        }
        // No subscribers is fine.
        let _ = self.state_tx.send(next);
    }

    /// Human-readable snapshot of the session and outstanding actions
    pub fn dump(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "[session]")?;
        writeln!(out, "address: {}", self.config.address)?;
        writeln!(out, "state: {}", self.state())?;
        writeln!(out, "connect_attempts: {}", self.connect_attempts())?;
        writeln!(out, "sessions_established: {}", self.sessions_established())?;
        match self.current_session() {
            Some(session) => {
                let info = session.info();
                writeln!(out, "authenticated: {}", info.authenticated)?;
                writeln!(out, "banner: {}", info.banner.as_deref().unwrap_or("-"))?;
                if let Some(peer) = info.peer {
                    writeln!(out, "peer: {}", peer)?;
                }
                writeln!(out, "connected_at: {}", info.connected_at.to_rfc3339())?;
                writeln!(out, "idle_ms: {}", info.idle_for.as_millis())?;
                writeln!(out, "blocks_read: {}", info.blocks_read)?;
                writeln!(out, "parse_errors: {}", info.parse_errors)?;
            }
            None => writeln!(out, "authenticated: false")?,
        }
        writeln!(out, "events_dispatched: {}", self.dispatcher.dispatched_count())?;
        writeln!(out, "events_unhandled: {}", self.dispatcher.unhandled_count())?;
        writeln!(out)?;

        writeln!(out, "[pending actions]")?;
        for pending in self.correlator.pending_snapshot() {
            writeln!(
                out,
                "{}: {} ({}ms)",
                pending.action_id,
                pending.action,
                pending.age.as_millis()
            )?;
        }
        writeln!(out)?;
        Ok(())
    }
}

async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    // The sender lives as long as the client, so this only returns on stop.
    let _ = stop_rx.wait_for(|stop| *stop).await;
}
