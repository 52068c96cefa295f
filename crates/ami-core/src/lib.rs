//! Asterisk Manager Interface client for the amistat stack
//!
//! This crate keeps one authenticated session to the manager interface alive,
//! decodes its block stream, correlates action responses and routes events to
//! registered handlers.
//!
//! # Layers
//!
//! - [`codec`]: `Key: Value` block framing
//! - [`transport`]: TCP session, login and the read loop
//! - [`correlator`]: `ActionID` bookkeeping with per-action deadlines
//! - [`dispatcher`]: event routing by event name
//! - [`keepalive`]: liveness pings
//! - [`client`]: the reconnect state machine tying it all together
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use amistat_ami_core::{AmiClient, AmiConfig, Event};
//!
//! # async fn example() -> Result<(), amistat_ami_core::AmiError> {
//! let client = Arc::new(AmiClient::new(AmiConfig::new("127.0.0.1:5038", "admin", "secret")));
//! client.register_handler("Hangup", Arc::new(|event: &Event| {
//!     println!("hangup of {:?}", event.get("Uniqueid"));
//! }));
//!
//! let runner = client.clone();
//! tokio::spawn(async move { runner.run().await });
//! // ... later
//! client.request_stop();
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod keepalive;
pub mod message;
pub mod transport;

pub use client::{AmiClient, ConnectionState};
pub use config::AmiConfig;
pub use correlator::{ActionCorrelator, BlockSink, PendingAction, PendingActionInfo};
pub use dispatcher::{EventDispatcher, EventHandler};
pub use error::{AmiError, AmiResult};
pub use keepalive::KeepAlive;
pub use message::{Action, Event, Fields, Message, Response};
pub use transport::{Session, SessionInfo, SessionReader};
