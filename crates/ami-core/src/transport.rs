//! Session transport
//!
//! One [`Session`] wraps one TCP connection to the manager interface. The
//! socket is split: the write half sits behind an async mutex so any task can
//! send blocks, and the read half is moved into the read loop, which decodes
//! blocks one at a time and hands them to the [`EventDispatcher`].
//!
//! [`Session::close`] is what unblocks a read loop that is waiting on a quiet
//! socket: it flips a watch channel the loop selects on.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::codec::{BlockReader, encode_block};
use crate::config::AmiConfig;
use crate::correlator::BlockSink;
use crate::dispatcher::EventDispatcher;
use crate::error::{AmiError, AmiResult};
use crate::message::{Action, Fields, Message};

/// Read side of a session, consumed by the read loop
pub struct SessionReader {
    blocks: BlockReader<BufReader<OwnedReadHalf>>,
}

impl fmt::Debug for SessionReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionReader")
    }
}

impl SessionReader {
    pub async fn read_block(&mut self) -> AmiResult<Option<Fields>> {
        self.blocks.read_block().await
    }
}

/// Point-in-time view of a session for dumps
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub address: String,
    pub peer: Option<SocketAddr>,
    pub banner: Option<String>,
    pub authenticated: bool,
    pub connected_at: DateTime<Utc>,
    pub idle_for: Duration,
    pub blocks_read: u64,
    pub parse_errors: u64,
    pub closed: bool,
}

/// One live connection to the manager interface
pub struct Session {
    address: String,
    peer: Option<SocketAddr>,
    banner: Option<String>,
    writer: Mutex<OwnedWriteHalf>,
    authenticated: AtomicBool,
    connected_at: DateTime<Utc>,
    last_activity: parking_lot::Mutex<Instant>,
    blocks_read: AtomicU64,
    parse_errors: AtomicU64,
    closed: watch::Sender<Option<String>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.address)
            .field("authenticated", &self.is_authenticated())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Open the TCP connection and consume the server greeting
    pub async fn connect(address: &str) -> AmiResult<(Arc<Session>, SessionReader)> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| AmiError::connection(format!("connect to {} failed: {}", address, e)))?;
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr().ok();

        let (read_half, write_half) = stream.into_split();
        let mut blocks = BlockReader::new(BufReader::new(read_half));
        let banner = blocks.read_greeting().await?;
        debug!(address, banner = ?banner, "TCP session established");

        let (closed, _) = watch::channel(None);
        let session = Arc::new(Session {
            address: address.to_string(),
            peer,
            banner,
            writer: Mutex::new(write_half),
            authenticated: AtomicBool::new(false),
            connected_at: Utc::now(),
            last_activity: parking_lot::Mutex::new(Instant::now()),
            blocks_read: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            closed,
        });
        Ok((session, SessionReader { blocks }))
    }

    /// Send the login action and wait for its response
    ///
    /// Runs before the read loop starts, so it reads from `reader` directly.
    /// Blocks other than the login response are skipped.
    pub async fn login(
        &self,
        reader: &mut SessionReader,
        action_id: &str,
        config: &AmiConfig,
    ) -> AmiResult<()> {
        let action = Action::login(&config.username, &config.secret, config.events.as_deref());
        self.send_block(&action.to_fields(action_id)).await?;

        loop {
            let fields = match reader.read_block().await {
                Ok(Some(fields)) => fields,
                Ok(None) => return Err(AmiError::connection("connection closed during login")),
                Err(e @ AmiError::ProtocolParse { .. }) => {
                    self.parse_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Skipping malformed block during login");
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.touch();

            match Message::classify(fields) {
                Message::Response(response) => {
                    if response.action_id().is_some_and(|id| id != action_id) {
                        trace!(
                            action_id = ?response.action_id(),
                            "Ignoring unrelated response during login"
                        );
                        continue;
                    }
                    if response.is_success() {
                        self.authenticated.store(true, Ordering::Relaxed);
                        return Ok(());
                    }
                    return Err(AmiError::authentication(
                        response.message().unwrap_or("login rejected"),
                    ));
                }
                _ => trace!("Ignoring block received before login completed"),
            }
        }
    }

    /// Decode blocks until the stream ends, a socket error occurs, or the
    /// session is closed. Returns the reason the loop stopped.
    pub async fn run_read_loop(
        self: Arc<Self>,
        mut reader: SessionReader,
        dispatcher: Arc<EventDispatcher>,
    ) -> String {
        let mut closed = self.closed.subscribe();

        loop {
            let close_reason = closed.borrow_and_update().clone();
            if let Some(reason) = close_reason {
                return reason;
            }

            tokio::select! {
                changed = closed.changed() => {
                    if changed.is_err() {
                        return "session dropped".to_string();
                    }
                }
                result = reader.read_block() => match result {
                    Ok(Some(fields)) => {
                        self.touch();
                        self.blocks_read.fetch_add(1, Ordering::Relaxed);
                        dispatcher.dispatch(fields);
                    }
                    Ok(None) => {
                        let reason = "end of stream".to_string();
                        self.close(&reason);
                        return reason;
                    }
                    Err(e @ AmiError::ProtocolParse { .. }) => {
                        self.parse_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(address = %self.address, error = %e, "Skipping malformed block");
                    }
                    Err(e) => {
                        let reason = format!("read failed: {}", e);
                        self.close(&reason);
                        return reason;
                    }
                }
            }
        }
    }

    /// Mark the session closed and wake the read loop
    ///
    /// Idempotent; the first reason wins.
    pub fn close(&self, reason: &str) {
        let first = self.closed.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason.to_string());
                true
            } else {
                false
            }
        });
        if first {
            info!(address = %self.address, reason, "Closing AMI session");
        }
    }

    /// Close and flush the write half
    pub async fn shutdown(&self, reason: &str) {
        self.close(reason);
        // A writer stuck on a full socket keeps the lock; dropping the
        // session releases the socket in that case.
        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = writer.shutdown().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.closed.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Relaxed)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    /// Time since the last block was read
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn parse_error_count(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            address: self.address.clone(),
            peer: self.peer,
            banner: self.banner.clone(),
            authenticated: self.is_authenticated(),
            connected_at: self.connected_at,
            idle_for: self.idle_for(),
            blocks_read: self.blocks_read.load(Ordering::Relaxed),
            parse_errors: self.parse_error_count(),
            closed: self.is_closed(),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

#[async_trait]
impl BlockSink for Session {
    async fn send_block(&self, fields: &Fields) -> AmiResult<()> {
        if self.is_closed() {
            return Err(AmiError::connection_lost("session closed"));
        }
        let bytes = encode_block(fields)?;
        trace!(fields = %fields, "Sending block");

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(&bytes).await {
            drop(writer);
            let reason = format!("write failed: {}", e);
            self.close(&reason);
            return Err(AmiError::connection(reason));
        }
        Ok(())
    }
}
