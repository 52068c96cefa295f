use thiserror::Error;

/// Errors raised while building metrics sinks
///
/// Emitting a metric never fails from the caller's point of view; these only
/// surface at setup time.
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Invalid metrics address {address}: {message}")]
    InvalidAddress { address: String, message: String },

    #[error("Metrics configuration error: {message}")]
    Configuration { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MetricsError {
    pub fn invalid_address(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

impl From<amistat_infra_common::Error> for MetricsError {
    fn from(err: amistat_infra_common::Error) -> Self {
        Self::configuration(err.to_string())
    }
}

pub type MetricsResult<T> = std::result::Result<T, MetricsError>;
