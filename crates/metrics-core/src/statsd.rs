//! StatsD over UDP
//!
//! Line encoding and datagram transport are handled by `cadence`; this module
//! adapts its client to [`MetricsSink`]. Sends never block and never fail
//! upward: a full socket buffer or an unreachable collector is logged at
//! debug and the metric is dropped.
//!
//! StatsD reads a leading sign on a gauge as a delta, so gauges always go out
//! as absolute values. The sink remembers the last value it sent for each
//! gauge and turns increments and decrements into sets.

use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, UdpSocket};

use cadence::prelude::*;
use cadence::{StatsdClient, UdpMetricSink};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info};

use amistat_infra_common::{Error as InfraError, Result as InfraResult, SelfValidating};

use crate::error::{MetricsError, MetricsResult};
use crate::sink::MetricsSink;

pub const DEFAULT_STATSD_PORT: u16 = 8125;

/// Collector endpoint
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatsdConfig {
    /// `host:port`
    pub address: String,

    /// Prepended to every metric name as `<prefix>.`
    #[serde(default)]
    pub prefix: Option<String>,
}

impl StatsdConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            prefix: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.prefix = if prefix.is_empty() { None } else { Some(prefix) };
        self
    }
}

impl SelfValidating for StatsdConfig {
    fn validate(&self) -> InfraResult<()> {
        if self.address.trim().is_empty() {
            return Err(InfraError::validation("statsd address must not be empty"));
        }
        Ok(())
    }
}

/// Fire-and-forget StatsD client
pub struct StatsdSink {
    client: StatsdClient,
    target: SocketAddr,
    prefix: Option<String>,
    gauges: Mutex<HashMap<String, u64>>,
}

impl fmt::Debug for StatsdSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsdSink")
            .field("target", &self.target)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl StatsdSink {
    /// Resolve the collector address and bind an ephemeral local socket
    pub async fn connect(config: &StatsdConfig) -> MetricsResult<Self> {
        config.validate()?;

        let target = tokio::net::lookup_host(config.address.as_str())
            .await
            .map_err(|e| MetricsError::invalid_address(&config.address, e.to_string()))?
            .next()
            .ok_or_else(|| {
                MetricsError::invalid_address(&config.address, "no addresses resolved")
            })?;

        let bind_addr: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_nonblocking(true)?;

        let udp = UdpMetricSink::from(target, socket)
            .map_err(|e| MetricsError::invalid_address(&config.address, e.to_string()))?;
        let client = StatsdClient::from_sink(config.prefix.as_deref().unwrap_or(""), udp);

        info!(target = %target, prefix = ?config.prefix, "StatsD sink ready");
        Ok(Self {
            client,
            target,
            prefix: config.prefix.clone(),
            gauges: Mutex::new(HashMap::new()),
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    fn report<T>(&self, name: &str, sent: cadence::MetricResult<T>) {
        if let Err(e) = sent {
            debug!(metric = name, error = %e, "Dropping StatsD metric");
        }
    }

    /// Apply `update` to the last sent value and send the result
    fn update_gauge(&self, name: &str, update: impl FnOnce(u64) -> u64) {
        let mut gauges = self.gauges.lock();
        let value = update(gauges.get(name).copied().unwrap_or(0));
        gauges.insert(name.to_string(), value);
        self.report(name, self.client.gauge(name, value));
    }
}

impl MetricsSink for StatsdSink {
    fn incr(&self, name: &str) {
        self.report(name, self.client.count(name, 1i64));
    }

    fn set_gauge(&self, name: &str, value: i64) {
        let value = u64::try_from(value).unwrap_or(0);
        self.update_gauge(name, |_| value);
    }

    fn incr_gauge(&self, name: &str) {
        self.update_gauge(name, |last| last.saturating_add(1));
    }

    fn decr_gauge(&self, name: &str) {
        self.update_gauge(name, |last| last.saturating_sub(1));
    }

    fn timing(&self, name: &str, millis: u64) {
        self.report(name, self.client.time(name, millis));
    }
}
