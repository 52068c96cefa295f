//! Client configuration
//!
//! ```rust
//! use amistat_ami_core::AmiConfig;
//! use std::time::Duration;
//!
//! let config = AmiConfig::new("127.0.0.1:5038", "admin", "secret")
//!     .with_keepalive_interval(Duration::from_millis(500))
//!     .with_reconnect_delay(Duration::from_millis(250));
//!
//! assert_eq!(config.events.as_deref(), Some("call,command"));
//! assert_eq!(config.keepalive_interval, Duration::from_millis(500));
//! ```

use std::fmt;
use std::time::Duration;

use amistat_infra_common::{Error as InfraError, SelfValidating};
use serde::Deserialize;

/// Default AMI TCP port
pub const DEFAULT_AMI_PORT: u16 = 5038;
/// Event classes requested at login
pub const DEFAULT_EVENTS: &str = "call,command";
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection and liveness settings for [`AmiClient`](crate::AmiClient)
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AmiConfig {
    /// `host:port` of the manager interface
    pub address: String,
    pub username: String,
    pub secret: String,
    /// Value of the `Events` login field; `None` omits the field
    pub events: Option<String>,
    /// Period of the keepalive ping, which is also its response deadline
    #[serde(with = "duration_ms", rename = "keepalive_interval_ms")]
    pub keepalive_interval: Duration,
    /// Fixed pause between connection attempts
    #[serde(with = "duration_ms", rename = "reconnect_delay_ms")]
    pub reconnect_delay: Duration,
    /// Default deadline for actions issued through the client
    #[serde(with = "duration_ms", rename = "action_timeout_ms")]
    pub action_timeout: Duration,
    /// Deadline for TCP connect plus login
    #[serde(with = "duration_ms", rename = "connect_timeout_ms")]
    pub connect_timeout: Duration,
}

impl Default for AmiConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{}", DEFAULT_AMI_PORT),
            username: String::new(),
            secret: String::new(),
            events: Some(DEFAULT_EVENTS.to_string()),
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl AmiConfig {
    pub fn new(
        address: impl Into<String>,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            username: username.into(),
            secret: secret.into(),
            ..Default::default()
        }
    }

    pub fn with_events(mut self, events: Option<String>) -> Self {
        self.events = events;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl SelfValidating for AmiConfig {
    fn validate(&self) -> amistat_infra_common::Result<()> {
        if self.address.trim().is_empty() {
            return Err(InfraError::validation("ami.address must not be empty"));
        }
        if self.username.is_empty() {
            return Err(InfraError::validation("ami.username must not be empty"));
        }
        for (name, value) in [
            ("keepalive_interval_ms", self.keepalive_interval),
            ("reconnect_delay_ms", self.reconnect_delay),
            ("action_timeout_ms", self.action_timeout),
            ("connect_timeout_ms", self.connect_timeout),
        ] {
            if value.is_zero() {
                return Err(InfraError::validation(format!(
                    "ami.{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }
}

// The secret stays out of logs and dumps.
impl fmt::Debug for AmiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmiConfig")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("events", &self.events)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("action_timeout", &self.action_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AmiConfig::default();
        assert_eq!(config.keepalive_interval, Duration::from_secs(1));
        assert_eq!(config.reconnect_delay, Duration::from_millis(100));
        assert_eq!(config.events.as_deref(), Some("call,command"));
    }

    #[test]
    fn test_validation() {
        assert!(AmiConfig::new("pbx:5038", "admin", "pw").validate().is_ok());
        assert!(AmiConfig::new("", "admin", "pw").validate().is_err());
        assert!(AmiConfig::new("pbx:5038", "", "pw").validate().is_err());
        assert!(
            AmiConfig::new("pbx:5038", "admin", "pw")
                .with_keepalive_interval(Duration::ZERO)
                .validate()
                .is_err()
        );

        let err = AmiConfig::new("pbx:5038", "admin", "pw")
            .with_reconnect_delay(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("reconnect_delay_ms"));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", AmiConfig::new("pbx:5038", "admin", "hunter2"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
