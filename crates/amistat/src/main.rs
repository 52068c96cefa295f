use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::error;

use amistat::{AppConfig, Args, Monitor, build_sink, spawn_signal_handler};
use amistat_infra_common::{log_welcome, setup_logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::from_args(&args).context("invalid configuration")?;

    setup_logging(config.logging.clone()).context("failed to set up logging")?;
    log_welcome("amistat", env!("CARGO_PKG_VERSION"), option_env!("AMISTAT_BUILD"));

    if let Some(reason) = &config.statsd_error {
        error!(reason = %reason, "Ignoring StatsD setting");
    }
    let sink = build_sink(config.statsd.as_ref()).await;

    let monitor = Arc::new(Monitor::new(config.ami.clone(), sink));
    let signals = spawn_signal_handler(monitor.clone(), config.dump_path.clone());

    let result = monitor.run().await;
    signals.abort();
    result.context("AMI client failed")
}
