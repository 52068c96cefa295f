//! End-to-end tests for amistat
//!
//! A fake manager interface on loopback TCP and a StatsD collector on
//! loopback UDP, with a real [`Monitor`] in between.

use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::{Duration, timeout};

use amistat::{Monitor, build_sink};
use amistat_ami_core::codec::BlockReader;
use amistat_ami_core::{AmiConfig, ConnectionState};
use amistat_metrics_core::StatsdConfig;

const WAIT: Duration = Duration::from_secs(5);

async fn recv_metric(collector: &UdpSocket) -> String {
    let mut buf = [0u8; 512];
    let len = timeout(WAIT, collector.recv(&mut buf))
        .await
        .expect("no metric received")
        .unwrap();
    String::from_utf8_lossy(&buf[..len]).to_string()
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}

/// Test a call travelling from manager events to StatsD datagrams
#[tokio::test]
async fn test_call_events_become_statsd_metrics() {
    let collector = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let statsd = StatsdConfig::new(collector.local_addr().unwrap().to_string()).with_prefix("pbx");
    let sink = build_sink(Some(&statsd)).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = AmiConfig::new(listener.local_addr().unwrap().to_string(), "admin", "secret")
        .with_keepalive_interval(Duration::from_secs(30));
    let monitor = Arc::new(Monitor::new(config, sink));

    let runner = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.run().await })
    };

    // Fake server: greet, accept the login, then replay one call.
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BlockReader::new(BufReader::new(read_half));
    writer.write_all(b"Asterisk Call Manager/5.0.1\r\n").await.unwrap();

    let login = timeout(WAIT, reader.read_block()).await.unwrap().unwrap().unwrap();
    assert_eq!(login.get("Action"), Some("Login"));
    let reply = format!(
        "Response: Success\r\nActionID: {}\r\nMessage: Authentication accepted\r\n\r\n",
        login.get("ActionID").unwrap()
    );
    writer.write_all(reply.as_bytes()).await.unwrap();

    wait_for(|| monitor.client().state() == ConnectionState::Running).await;

    writer
        .write_all(
            b"Event: Newchannel\r\nChannel: PJSIP/100-00000001\r\nUniqueid: 1700000000.7\r\n\r\n\
              Event: Newstate\r\nChannelStateDesc: Up\r\nUniqueid: 1700000000.7\r\n\r\n",
        )
        .await
        .unwrap();

    assert_eq!(recv_metric(&collector).await, "pbx.calls.started:1|c");
    assert_eq!(recv_metric(&collector).await, "pbx.calls.active:1|g");
    assert_eq!(recv_metric(&collector).await, "pbx.calls.state.up:1|c");
    assert_eq!(monitor.pending_call_count(), 1);

    let mut dump = Vec::new();
    monitor.dump_state(&mut dump).unwrap();
    let dump = String::from_utf8(dump).unwrap();
    assert!(dump.contains("state: running"));
    assert!(dump.contains("1700000000.7: channel=PJSIP/100-00000001 state=Up"));

    writer
        .write_all(b"Event: Hangup\r\nUniqueid: 1700000000.7\r\nCause: 16\r\n\r\n")
        .await
        .unwrap();

    assert_eq!(recv_metric(&collector).await, "pbx.calls.ended:1|c");
    assert_eq!(recv_metric(&collector).await, "pbx.calls.ended.cause.16:1|c");
    let duration = recv_metric(&collector).await;
    assert!(duration.starts_with("pbx.calls.duration:") && duration.ends_with("|ms"));
    assert_eq!(recv_metric(&collector).await, "pbx.calls.active:0|g");

    assert_eq!(monitor.pending_call_count(), 0);
    assert_eq!(monitor.gauge_snapshot().get("calls.active"), Some(&0));

    monitor.request_stop();
    timeout(WAIT, runner).await.unwrap().unwrap().unwrap();
    assert_eq!(monitor.client().state(), ConnectionState::Stopped);
}

/// Test that an unresolvable collector falls back to discarding metrics
#[tokio::test]
async fn test_unresolvable_statsd_falls_back_to_noop() {
    let sink = build_sink(Some(&StatsdConfig::new("no-such-host.invalid:8125"))).await;
    let monitor = Monitor::new(AmiConfig::new("127.0.0.1:5038", "admin", "pw"), sink);

    monitor.tracker().call_started("1", "SIP/1-01");
    assert_eq!(monitor.pending_call_count(), 1);
    assert_eq!(monitor.gauge_snapshot().get("calls.active"), Some(&1));
}
