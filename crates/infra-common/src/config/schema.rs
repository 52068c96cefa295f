use crate::errors::types::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::Path;

/// Trait for configuration types that can validate themselves
pub trait SelfValidating: Sized {
    /// Validate the configuration
    fn validate(&self) -> Result<()>;

    /// Validate after loading
    fn validate_after_load(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }
}

/// Parse and validate a configuration from a TOML string
pub fn load_toml_str<T>(source: &str) -> Result<T>
where
    T: DeserializeOwned + SelfValidating,
{
    let config: T =
        toml::from_str(source).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))?;
    config.validate_after_load()
}

/// Read, parse and validate a configuration file
pub fn load_toml_file<T>(path: impl AsRef<Path>) -> Result<T>
where
    T: DeserializeOwned + SelfValidating,
{
    let path = path.as_ref();
    let source = std::fs::read_to_string(path)?;
    load_toml_str(&source)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
}
