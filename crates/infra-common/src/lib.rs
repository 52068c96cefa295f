/*!
Common infrastructure for the amistat workspace.

- `errors`: shared error type for configuration and startup failures
- `logging`: tracing subscriber setup
- `config`: self-validating TOML configuration loading
*/

pub mod config;
pub mod errors;
pub mod logging;

pub use config::{SelfValidating, load_toml_file, load_toml_str};
pub use errors::{Error, Result};
pub use logging::{LoggingConfig, log_welcome, parse_log_level, setup_logging};
