//! OS signal boundary
//!
//! Translates process signals into [`Monitor`] calls:
//!
//! - `SIGINT`, `SIGTERM`: stop
//! - `SIGUSR1`: log a status line
//! - `SIGUSR2`: write the state dump file
//!
//! Builds without unix signals handle Ctrl-C only.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::monitor::Monitor;

/// Listen for signals until the task is aborted
pub fn spawn_signal_handler(monitor: Arc<Monitor>, dump_path: PathBuf) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = listen(monitor, dump_path).await {
            error!(error = %e, "Signal handler failed to install");
        }
    })
}

#[cfg(unix)]
fn write_dump(monitor: &Monitor, dump_path: &std::path::Path) {
    match monitor.dump_to_file(dump_path) {
        Ok(()) => info!(path = %dump_path.display(), "State dumped"),
        Err(e) => error!(path = %dump_path.display(), error = %e, "State dump failed"),
    }
}

#[cfg(unix)]
async fn listen(monitor: Arc<Monitor>, dump_path: PathBuf) -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;

    loop {
        tokio::select! {
            _ = interrupt.recv() => {
                info!("SIGINT received");
                monitor.request_stop();
            }
            _ = terminate.recv() => {
                info!("SIGTERM received");
                monitor.request_stop();
            }
            _ = usr1.recv() => monitor.log_status(),
            _ = usr2.recv() => write_dump(&monitor, &dump_path),
        }
    }
}

#[cfg(not(unix))]
async fn listen(monitor: Arc<Monitor>, dump_path: PathBuf) -> std::io::Result<()> {
    let _ = dump_path;
    loop {
        tokio::signal::ctrl_c().await?;
        info!("Ctrl-C received");
        monitor.request_stop();
    }
}
