//! Error types for the AMI client
//!
//! Every failure the client can produce falls into one of a handful of
//! categories. None of them is fatal to the process: connection and
//! authentication failures are retried by the reconnect loop, malformed
//! blocks are skipped, and action failures are reported to the caller that
//! issued the action.

use std::time::Duration;

use thiserror::Error;

/// Result type for AMI client operations
pub type AmiResult<T> = Result<T, AmiError>;

/// Errors that can occur in the AMI client
#[derive(Debug, Error)]
pub enum AmiError {
    /// The socket could not be established or broke while in use
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// The server rejected the login
    #[error("Authentication rejected: {message}")]
    Authentication { message: String },

    /// A single block could not be decoded
    #[error("Protocol parse error: {message} (line: {line:?})")]
    ProtocolParse { message: String, line: String },

    /// A field cannot be written without changing its meaning on the wire
    #[error("Invalid field {key:?}: {message}")]
    InvalidField { message: String, key: String },

    /// No response arrived for an action within its window
    #[error("Action {action} (ActionID {action_id}) timed out after {timeout_ms}ms")]
    ActionTimeout {
        action: String,
        action_id: String,
        timeout_ms: u64,
    },

    /// The session ended while the action was outstanding
    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    /// An action was issued while no session is live
    #[error("Not connected")]
    NotConnected,

    /// Invalid client configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AmiError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create an authentication error
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    /// Create a protocol parse error for the offending line
    pub fn protocol_parse(message: impl Into<String>, line: impl Into<String>) -> Self {
        Self::ProtocolParse {
            message: message.into(),
            line: line.into(),
        }
    }

    /// Create an invalid field error
    pub fn invalid_field(message: impl Into<String>, key: impl Into<String>) -> Self {
        Self::InvalidField {
            message: message.into(),
            key: key.into(),
        }
    }

    /// Create an action timeout error
    pub fn action_timeout(
        action: impl Into<String>,
        action_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self::ActionTimeout {
            action: action.into(),
            action_id: action_id.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create a connection lost error
    pub fn connection_lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether the reconnect loop can recover from this error by retrying
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, AmiError::Configuration { .. })
    }

    /// Whether this error means the session itself is unusable
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            AmiError::Connection { .. }
                | AmiError::ConnectionLost { .. }
                | AmiError::NotConnected
                | AmiError::Io(_)
        )
    }
}

impl From<amistat_infra_common::Error> for AmiError {
    fn from(error: amistat_infra_common::Error) -> Self {
        AmiError::configuration(error.to_string())
    }
}
