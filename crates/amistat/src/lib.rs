//! amistat: Asterisk call metrics for StatsD
//!
//! Keeps a manager interface session alive, follows calls through their
//! lifecycle events and reports call counts, active calls and durations.

pub mod config;
pub mod monitor;
pub mod signals;

pub use config::{AmiUrl, AppConfig, Args, parse_statsd_url};
pub use monitor::{Monitor, build_sink};
pub use signals::spawn_signal_handler;
