//! Application configuration
//!
//! Settings come from an optional TOML file, then command-line flags override
//! individual values. The two connection strings accepted on the command line
//! are `user:password@host:port` for the manager interface and
//! `host[:port][/prefix]` for StatsD.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::Parser;
use serde::Deserialize;

use amistat_ami_core::AmiConfig;
use amistat_ami_core::config::DEFAULT_AMI_PORT;
use amistat_infra_common::{
    Error, LoggingConfig, Result, SelfValidating, load_toml_file, parse_log_level,
};
use amistat_metrics_core::{DEFAULT_STATSD_PORT, StatsdConfig};

pub const DEFAULT_DUMP_FILE: &str = "dump.txt";

/// Command-line flags
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about = "Asterisk call metrics for StatsD", long_about = None)]
pub struct Args {
    /// Manager interface as user:password@host:port
    #[arg(short, long, value_name = "URL")]
    pub asterisk: Option<String>,

    /// StatsD collector as host:port/prefix; metrics are disabled without it
    #[arg(short, long, value_name = "URL")]
    pub statsd: Option<String>,

    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    /// File written on SIGUSR2
    #[arg(long, value_name = "FILE")]
    pub dump_file: Option<PathBuf>,
}

/// Manager interface credentials and address parsed from `user:password@host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmiUrl {
    pub username: String,
    pub secret: String,
    pub address: String,
}

impl FromStr for AmiUrl {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let invalid = || {
            Error::config(format!(
                "invalid asterisk url {:?}, expected user:password@host:port",
                raw
            ))
        };

        let (username, rest) = raw.split_once(':').ok_or_else(invalid)?;
        let (secret, host) = rest.split_once('@').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }

        let has_port = host
            .rsplit_once(':')
            .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
        let address = if has_port {
            host.to_string()
        } else {
            format!("{}:{}", host, DEFAULT_AMI_PORT)
        };

        Ok(Self {
            username: username.to_string(),
            secret: secret.to_string(),
            address,
        })
    }
}

/// Parse `host[:port][/prefix]`
pub fn parse_statsd_url(raw: &str) -> Result<StatsdConfig> {
    let invalid = |why: &str| Error::config(format!("invalid statsd url {:?}: {}", raw, why));

    let (endpoint, prefix) = match raw.split_once('/') {
        Some((endpoint, prefix)) => (endpoint, prefix),
        None => (raw, ""),
    };
    let (host, port) = match endpoint.split_once(':') {
        Some((host, "")) => (host, DEFAULT_STATSD_PORT),
        Some((host, port)) => (
            host,
            port.parse::<u16>().map_err(|_| invalid("bad port"))?,
        ),
        None => (endpoint, DEFAULT_STATSD_PORT),
    };
    if host.is_empty() {
        return Err(invalid("missing host"));
    }

    Ok(StatsdConfig::new(format!("{}:{}", host, port)).with_prefix(prefix))
}

/// Everything the binary needs to start
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub ami: AmiConfig,
    pub statsd: Option<StatsdConfig>,
    pub logging: LoggingConfig,
    pub dump_path: PathBuf,

    /// Why a StatsD url given on the command line was rejected; logged once
    /// logging is up, and metrics run on the no-op sink
    #[serde(skip)]
    pub statsd_error: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ami: AmiConfig::default(),
            statsd: None,
            logging: LoggingConfig::default(),
            dump_path: PathBuf::from(DEFAULT_DUMP_FILE),
            statsd_error: None,
        }
    }
}

impl SelfValidating for AppConfig {
    fn validate(&self) -> Result<()> {
        self.ami.validate()?;
        if let Some(statsd) = &self.statsd {
            statsd.validate()?;
        }
        if self.dump_path.as_os_str().is_empty() {
            return Err(Error::validation("dump_path must not be empty"));
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load the optional config file and apply command-line overrides
    pub fn from_args(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => load_file_unvalidated(path)?,
            None => Self::default(),
        };
        config.apply_args(args)?;
        config.validate_after_load()
    }

    fn apply_args(&mut self, args: &Args) -> Result<()> {
        if let Some(raw) = &args.asterisk {
            let url: AmiUrl = raw.parse()?;
            self.ami.username = url.username;
            self.ami.secret = url.secret;
            self.ami.address = url.address;
        }

        if let Some(raw) = &args.statsd {
            match parse_statsd_url(raw) {
                Ok(statsd) => self.statsd = Some(statsd),
                Err(e) => {
                    self.statsd = None;
                    self.statsd_error = Some(e.to_string());
                }
            }
        }

        if let Some(level) = &args.log_level {
            self.logging.level = parse_log_level(level)?;
        }
        if args.json_logs {
            self.logging.json = true;
        }
        if let Some(path) = &args.dump_file {
            self.dump_path = path.clone();
        }
        Ok(())
    }
}

/// The file may leave out credentials that the command line supplies, so
/// validation waits until overrides are applied.
fn load_file_unvalidated(path: &Path) -> Result<AppConfig> {
    #[derive(Deserialize)]
    #[serde(transparent)]
    struct Unchecked(AppConfig);

    impl SelfValidating for Unchecked {
        fn validate(&self) -> Result<()> {
            Ok(())
        }
    }

    load_toml_file::<Unchecked>(path).map(|unchecked| unchecked.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_ami_url() {
        let url: AmiUrl = "admin:s3cret@pbx.local:5038".parse().unwrap();
        assert_eq!(url.username, "admin");
        assert_eq!(url.secret, "s3cret");
        assert_eq!(url.address, "pbx.local:5038");
    }

    #[test]
    fn test_ami_url_splits_at_first_separators() {
        let url: AmiUrl = "admin:pa:ss@word@10.0.0.1:5038".parse().unwrap();
        assert_eq!(url.username, "admin");
        assert_eq!(url.secret, "pa:ss");
        assert_eq!(url.address, "word@10.0.0.1:5038");
    }

    #[test]
    fn test_ami_url_default_port() {
        let url: AmiUrl = "admin:pw@pbx.local".parse().unwrap();
        assert_eq!(url.address, "pbx.local:5038");
    }

    #[test]
    fn test_ami_url_rejects_garbage() {
        for raw in ["pbx.local:5038", "admin@pbx", "admin:pw@", ""] {
            assert!(raw.parse::<AmiUrl>().is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn test_statsd_url() {
        let config = parse_statsd_url("metrics.local:9125/pbx1").unwrap();
        assert_eq!(config.address, "metrics.local:9125");
        assert_eq!(config.prefix.as_deref(), Some("pbx1"));

        let config = parse_statsd_url("metrics.local").unwrap();
        assert_eq!(config.address, "metrics.local:8125");
        assert_eq!(config.prefix, None);

        let config = parse_statsd_url("127.0.0.1/asterisk").unwrap();
        assert_eq!(config.address, "127.0.0.1:8125");
        assert_eq!(config.prefix.as_deref(), Some("asterisk"));
    }

    #[test]
    fn test_statsd_url_rejects_garbage() {
        assert!(parse_statsd_url("").is_err());
        assert!(parse_statsd_url(":8125").is_err());
        assert!(parse_statsd_url("host:notaport").is_err());
    }

    #[test]
    fn test_from_args_cli_only() {
        let args = Args {
            asterisk: Some("admin:pw@127.0.0.1:5038".to_string()),
            statsd: Some("127.0.0.1:8125/pbx".to_string()),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };
        let config = AppConfig::from_args(&args).unwrap();
        assert_eq!(config.ami.username, "admin");
        assert_eq!(config.statsd.unwrap().prefix.as_deref(), Some("pbx"));
        assert_eq!(config.logging.level, tracing::Level::DEBUG);
        assert_eq!(config.dump_path, PathBuf::from("dump.txt"));
        assert!(config.statsd_error.is_none());
    }

    #[test]
    fn test_bad_statsd_url_disables_metrics() {
        let args = Args {
            asterisk: Some("admin:pw@127.0.0.1:5038".to_string()),
            statsd: Some("host:bad".to_string()),
            ..Default::default()
        };
        let config = AppConfig::from_args(&args).unwrap();
        assert!(config.statsd.is_none());
        assert!(config.statsd_error.unwrap().contains("host:bad"));
    }

    #[test]
    fn test_bad_asterisk_url_is_an_error() {
        let args = Args {
            asterisk: Some("no-credentials".to_string()),
            ..Default::default()
        };
        assert!(AppConfig::from_args(&args).is_err());
    }

    #[test]
    fn test_missing_credentials_fail_validation() {
        assert!(AppConfig::from_args(&Args::default()).is_err());
    }

    #[test]
    fn test_file_with_cli_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
dump_path = "/tmp/amistat-dump.txt"

[ami]
address = "10.0.0.5:5038"
username = "monitor"
secret = "from-file"
keepalive_interval_ms = 2000

[statsd]
address = "127.0.0.1:8125"
prefix = "pbx"

[logging]
level = "warn"
"#
        )
        .unwrap();

        let args = Args {
            config: Some(file.path().to_path_buf()),
            asterisk: Some("admin:from-cli@10.0.0.6:5038".to_string()),
            ..Default::default()
        };
        let config = AppConfig::from_args(&args).unwrap();
        assert_eq!(config.ami.username, "admin");
        assert_eq!(config.ami.secret, "from-cli");
        assert_eq!(config.ami.address, "10.0.0.6:5038");
        assert_eq!(config.ami.keepalive_interval, Duration::from_secs(2));
        assert_eq!(config.statsd.unwrap().prefix.as_deref(), Some("pbx"));
        assert_eq!(config.logging.level, tracing::Level::WARN);
        assert_eq!(config.dump_path, PathBuf::from("/tmp/amistat-dump.txt"));
    }

    #[test]
    fn test_file_may_omit_credentials_given_on_cli() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[ami]\nreconnect_delay_ms = 250").unwrap();

        let args = Args {
            config: Some(file.path().to_path_buf()),
            asterisk: Some("admin:pw@127.0.0.1:5038".to_string()),
            ..Default::default()
        };
        let config = AppConfig::from_args(&args).unwrap();
        assert_eq!(config.ami.reconnect_delay, Duration::from_millis(250));
    }
}
