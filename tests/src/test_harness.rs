// Test harness for mqprobe end-to-end tests
//
// Provides:
// - A mock broker shared by any number of publisher/subscriber drivers
// - Role configurations pointed at a scratch output directory
// - A summary writer with a fixed timestamp so file names are predictable

use std::path::{Path, PathBuf};
use std::sync::Arc;

use mqprobe_core::{Role, SessionConfig};
use mqprobe_session::{Publisher, Subscriber, SummaryWriter};
use mqprobe_transport::mock::{LinkProfile, MockBroker};
use tempfile::TempDir;

/// Test result type alias
pub type TestResult<T> = anyhow::Result<T>;

/// Timestamp used for every file the harness writer produces.
pub const FIXED_STAMP: &str = "2026-01-01_00-00-00";

/// Route driver logs through the test writer. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::new("info,mqprobe_session=debug"))
        .try_init();
}

pub struct TestHarness {
    broker: MockBroker,
    dir: TempDir,
}

impl TestHarness {
    pub fn new(profile: LinkProfile) -> TestResult<Self> {
        Ok(Self { broker: MockBroker::new(profile, 0x6d71), dir: tempfile::tempdir()? })
    }

    pub fn broker(&self) -> &MockBroker {
        &self.broker
    }

    pub fn output_dir(&self) -> &Path {
        self.dir.path()
    }

    /// Defaults for `role`, writing under the scratch directory.
    pub fn config(&self, role: Role) -> SessionConfig {
        let mut cfg = SessionConfig::defaults(role);
        cfg.output_dir = self.dir.path().to_path_buf();
        cfg
    }

    pub fn publisher(&self, cfg: SessionConfig) -> Publisher {
        let (client, events) = self.broker.client(cfg.broker.client_id.clone());
        Publisher::new(cfg, Arc::new(client), events)
    }

    pub fn subscriber(&self, cfg: SessionConfig) -> Subscriber {
        let (client, events) = self.broker.client(cfg.broker.client_id.clone());
        Subscriber::new(cfg, Arc::new(client), events)
    }

    pub fn writer(&self) -> SummaryWriter {
        SummaryWriter::with_stamp(self.dir.path(), FIXED_STAMP)
    }

    pub fn read_json(&self, path: impl AsRef<Path>) -> TestResult<serde_json::Value> {
        let full: PathBuf = self.dir.path().join(path);
        Ok(serde_json::from_str(&std::fs::read_to_string(full)?)?)
    }
}
