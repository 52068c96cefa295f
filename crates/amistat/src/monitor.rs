//! Control-plane facade
//!
//! [`Monitor`] wires the manager interface client to the call tracker and is
//! the one object the binary and the signal boundary talk to.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};

use amistat_ami_core::{AmiClient, AmiConfig, AmiResult};
use amistat_metrics_core::{
    CallTracker, GaugeStore, MetricsSink, NoopSink, StatsdConfig, StatsdSink,
    register_call_handlers,
};

/// Build the StatsD sink, or the no-op sink when none is configured or the
/// collector address does not resolve
pub async fn build_sink(config: Option<&StatsdConfig>) -> Arc<dyn MetricsSink> {
    let Some(config) = config else {
        warn!("No StatsD collector configured, metrics are discarded");
        return Arc::new(NoopSink);
    };
    match StatsdSink::connect(config).await {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            error!(
                address = %config.address,
                error = %e,
                "StatsD sink unavailable, metrics are discarded"
            );
            Arc::new(NoopSink)
        }
    }
}

pub struct Monitor {
    client: Arc<AmiClient>,
    tracker: Arc<CallTracker>,
    gauges: Arc<GaugeStore>,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("client", &self.client)
            .field("tracker", &self.tracker)
            .finish()
    }
}

impl Monitor {
    /// Create the client and bind the call handlers to it
    pub fn new(config: AmiConfig, sink: Arc<dyn MetricsSink>) -> Self {
        let client = Arc::new(AmiClient::new(config));
        let gauges = Arc::new(GaugeStore::new(sink.clone()));
        let tracker = Arc::new(CallTracker::new(sink.clone(), gauges.clone()));
        register_call_handlers(client.dispatcher(), tracker.clone(), sink);

        Self {
            client,
            tracker,
            gauges,
        }
    }

    pub fn client(&self) -> &Arc<AmiClient> {
        &self.client
    }

    pub fn tracker(&self) -> &Arc<CallTracker> {
        &self.tracker
    }

    /// Run the reconnect loop until [`request_stop`](Self::request_stop)
    pub async fn run(&self) -> AmiResult<()> {
        self.client.run().await
    }

    pub fn request_stop(&self) {
        self.client.request_stop();
    }

    pub fn pending_action_count(&self) -> usize {
        self.client.pending_action_count()
    }

    pub fn pending_call_count(&self) -> usize {
        self.tracker.pending_call_count()
    }

    pub fn gauge_snapshot(&self) -> BTreeMap<String, i64> {
        self.gauges.snapshot()
    }

    /// Write the session, pending actions, pending calls and gauges
    pub fn dump_state(&self, out: &mut dyn Write) -> io::Result<()> {
        self.client.dump(out)?;
        self.tracker.dump(out)
    }

    /// Truncate `path` and write [`dump_state`](Self::dump_state) into it
    pub fn dump_to_file(&self, path: &Path) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        self.dump_state(&mut out)?;
        out.flush()
    }

    /// One-line status at info level
    pub fn log_status(&self) {
        info!(
            pending_calls = self.pending_call_count(),
            pending_actions = self.pending_action_count(),
            state = %self.client.state(),
            gauges = ?self.gauge_snapshot(),
            "Status"
        );
    }
}
