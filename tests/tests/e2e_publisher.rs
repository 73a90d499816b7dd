// Publisher end-to-end runs against the mock broker.

use std::collections::BTreeSet;
use std::time::Duration;

use mqprobe_core::{FaultConfig, QosLevel, Role};
use mqprobe_integration_tests::{init_tracing, TestHarness, TestResult};
use mqprobe_transport::mock::LinkProfile;

/// Five QoS 0 messages acknowledged 10 ms after submission.
#[tokio::test(start_paused = true)]
async fn qos0_publish_delay_matches_ack_latency() -> TestResult<()> {
    init_tracing();
    let harness = TestHarness::new(LinkProfile { ack_delay: Duration::from_millis(10), ..Default::default() })?;
    let mut cfg = harness.config(Role::Publisher);
    cfg.total_packets = 5;
    cfg.qos = QosLevel::AtMostOnce;
    cfg.send_interval = Duration::from_millis(100);

    let report = harness.publisher(cfg).run().await?;
    let stats = report.delay_stats()?;
    assert_eq!(stats.count, 5);
    assert!((stats.mean - 10.0).abs() < 0.01, "mean {}", stats.mean);
    assert!(stats.min <= stats.median && stats.median <= stats.max);
    assert!(report.disconnects.is_empty());
    assert_eq!(harness.broker().stats().published, 5);
    Ok(())
}

/// Forced disconnects during a run: every sequence number is still published
/// exactly once and every gap is closed by a reconnect.
#[tokio::test(start_paused = true)]
async fn survives_injected_disconnects() -> TestResult<()> {
    init_tracing();
    let harness = TestHarness::new(LinkProfile {
        ack_delay: Duration::from_millis(5),
        connect_latency: Duration::from_millis(20),
        ..Default::default()
    })?;
    let mut cfg = harness.config(Role::Publisher);
    cfg.total_packets = 10;
    cfg.qos = QosLevel::AtLeastOnce;
    cfg.send_interval = Duration::from_millis(300);
    cfg.ack_wait_timeout = Some(Duration::from_secs(10));
    cfg.fault = FaultConfig { probability: 1.0, interval: Duration::from_secs(1), duration: Duration::from_secs(1) };

    let report = harness.publisher(cfg).with_fault_seed(9).run().await?;

    let seqs: Vec<u64> = report.dataset.iter().filter_map(|e| e.as_message()).filter_map(|m| m.seq_num).collect();
    let distinct: BTreeSet<u64> = seqs.iter().copied().collect();
    assert_eq!(seqs.len(), 10);
    assert_eq!(distinct, (1..=10).collect());

    assert!(!report.disconnects.is_empty());
    for gap in &report.disconnects {
        assert!(gap.reconnect_time.is_some_and(|t| t > gap.disconnect_time), "{gap:?}");
    }
    assert_eq!(report.connections.len(), report.disconnects.len() + 1);
    assert_eq!(report.delay_stats()?.count, 10);
    Ok(())
}

/// The broker refuses the first connects; the run still completes and the
/// connection record counts every try.
#[tokio::test(start_paused = true)]
async fn refused_connects_are_retried() -> TestResult<()> {
    init_tracing();
    let harness = TestHarness::new(LinkProfile { ack_delay: Duration::from_millis(1), ..Default::default() })?;
    harness.broker().refuse_connects(3);
    let mut cfg = harness.config(Role::Publisher);
    cfg.total_packets = 2;

    let report = harness.publisher(cfg).run().await?;
    assert_eq!(report.connections.len(), 1);
    assert_eq!(report.connections[0].tries, 4);
    assert!(report.connections[0].time_diff > 0.0);
    assert_eq!(harness.broker().stats().refused, 3);
    Ok(())
}
