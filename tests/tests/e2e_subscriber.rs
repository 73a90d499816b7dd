// Subscriber end-to-end runs against the mock broker.

use std::time::Duration;

use mqprobe_core::{DatasetEntry, FaultConfig, Payload, QosLevel, Role};
use mqprobe_integration_tests::{init_tracing, TestHarness, TestResult};
use mqprobe_transport::mock::LinkProfile;
use mqprobe_transport::BrokerClient;

/// Certain faults every second for five seconds.
#[tokio::test(start_paused = true)]
async fn periodic_faults_are_recorded_and_recovered() -> TestResult<()> {
    init_tracing();
    let harness = TestHarness::new(LinkProfile { connect_latency: Duration::from_millis(50), ..Default::default() })?;
    let mut cfg = harness.config(Role::Subscriber);
    cfg.fault = FaultConfig { probability: 1.0, interval: Duration::from_secs(1), duration: Duration::from_secs(1) };

    let report = harness.subscriber(cfg).with_fault_seed(1).run(tokio::time::sleep(Duration::from_secs(5))).await?;

    assert!(report.disconnects.len() >= 3, "{:?}", report.disconnects);
    for gap in &report.disconnects {
        assert!(gap.reconnect_time.is_some_and(|t| t > gap.disconnect_time), "{gap:?}");
    }
    let markers = report.dataset.iter().filter(|e| matches!(e, DatasetEntry::Disconnect(_))).count();
    assert_eq!(markers, report.disconnects.len());
    Ok(())
}

/// Messages published while the subscriber is away are handed over on
/// reconnect (QoS 1, persistent session); QoS 0 ones are lost.
#[tokio::test(start_paused = true)]
async fn persistent_session_keeps_qos1_messages() -> TestResult<()> {
    init_tracing();
    let harness = TestHarness::new(LinkProfile {
        delivery_latency: Duration::from_millis(5),
        connect_latency: Duration::from_millis(10),
        ..Default::default()
    })?;
    let mut cfg = harness.config(Role::Subscriber);
    cfg.qos = QosLevel::AtLeastOnce;
    cfg.total_packets = 4;
    cfg.reconnect_delay = Some(Duration::from_millis(500));
    let sub = harness.subscriber(cfg);
    let clock = *sub.state().clock();
    let driver = tokio::spawn(sub.run(tokio::time::sleep(Duration::from_secs(2))));

    let (publisher, _events) = harness.broker().client("mqprobe-pub");
    publisher.connect().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(harness.broker().drop_link("mqprobe-sub"));
    publisher.publish("test", Payload::new(1, clock.now_ms()).encode(), QosLevel::AtLeastOnce).await?;
    publisher.publish("test", Payload::new(2, clock.now_ms()).encode(), QosLevel::AtMostOnce).await?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    publisher.publish("test", Payload::new(3, clock.now_ms()).encode(), QosLevel::AtLeastOnce).await?;

    let report = driver.await??;
    let seqs: Vec<u64> = report.dataset.iter().filter_map(|e| e.as_message()).filter_map(|m| m.seq_num).collect();
    assert_eq!(seqs, vec![1, 3]);
    assert_eq!(report.received(), 2);
    assert_eq!(report.loss()?, 0.5);

    // seq 1 waited out the reconnect delay plus the connect latency
    let held = report.dataset.iter().filter_map(|e| e.as_message()).find(|m| m.seq_num == Some(1));
    let delay = held.and_then(|m| m.time_diff).unwrap_or_default();
    assert!(delay > 509.0, "{delay}");
    assert_eq!(report.disconnects.len(), 1);
    Ok(())
}
