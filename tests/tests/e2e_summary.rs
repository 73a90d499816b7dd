// Publisher and subscriber sharing one broker, followed by the summary
// handoff between them.

use std::time::Duration;

use mqprobe_core::{QosLevel, Role};
use mqprobe_integration_tests::{init_tracing, TestHarness, TestResult, FIXED_STAMP};
use mqprobe_transport::mock::LinkProfile;
use tokio::sync::oneshot;

#[tokio::test(start_paused = true)]
async fn publisher_then_subscriber_summary() -> TestResult<()> {
    init_tracing();
    let harness = TestHarness::new(LinkProfile {
        ack_delay: Duration::from_millis(10),
        delivery_latency: Duration::from_millis(20),
        ..Default::default()
    })?;

    let mut sub_cfg = harness.config(Role::Subscriber);
    sub_cfg.qos = QosLevel::AtLeastOnce;
    sub_cfg.total_packets = 5;
    sub_cfg.label = "baseline".into();
    let mut pub_cfg = harness.config(Role::Publisher);
    pub_cfg.qos = QosLevel::AtLeastOnce;
    pub_cfg.total_packets = 5;
    pub_cfg.label = "baseline".into();
    pub_cfg.send_interval = Duration::from_millis(100);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let subscriber = tokio::spawn(harness.subscriber(sub_cfg).run(async move {
        let _ = stop_rx.await;
    }));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let pub_report = harness.publisher(pub_cfg).run().await?;
    let writer = harness.writer();
    let pub_files = writer.write(&pub_report)?;
    assert_eq!(pub_files.summary, writer.summary_path("baseline"));
    assert!(pub_files.summary.exists());

    tokio::time::sleep(Duration::from_millis(200)).await;
    let _ = stop_tx.send(());
    let sub_report = subscriber.await??;
    assert_eq!(sub_report.received(), 5);
    let e2e = sub_report.delay_stats()?;
    assert!((e2e.mean - 20.0).abs() < 0.01, "mean {}", e2e.mean);

    let sub_files = writer.write(&sub_report)?;
    assert_eq!(sub_files.summary, writer.stamped_summary_path("baseline"));
    assert!(!writer.summary_path("baseline").exists());

    let doc = harness.read_json(format!("summary/{FIXED_STAMP}_baseline.json"))?;
    let publisher = &doc["publisher"];
    let subscriber = &doc["subscriber"];
    assert_eq!(publisher["pkt_sent"], 5);
    assert_eq!(publisher["pub_delay"]["count"], 5);
    assert_eq!(publisher["qos"], 1);
    assert_eq!(subscriber["pkt_recv"], 5);
    assert_eq!(subscriber["pkt_loss"], 0.0);
    assert_eq!(subscriber["e2e_delay"]["count"], 5);
    assert_eq!(subscriber["conn_tries"]["max"], 1.0);
    assert_eq!(subscriber["disconnects"], 0);

    let data_file = subscriber["e2e_data_file"].as_str().unwrap_or_default();
    assert_eq!(data_file, format!("data/sub/{FIXED_STAMP}_qos-1_netcond-baseline.json"));
    let dataset = harness.read_json(data_file)?;
    assert_eq!(dataset.as_array().map(Vec::len), Some(5));
    Ok(())
}
