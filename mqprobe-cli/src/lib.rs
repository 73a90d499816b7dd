#![forbid(unsafe_code)]

//! Pieces shared by the `mqprobe-pub` and `mqprobe-sub` binaries.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mqprobe_core::config::CONFIG_ENV;
use mqprobe_core::{Role, SessionConfig};
use mqprobe_session::{SessionReport, SummaryWriter, WrittenFiles};
use mqprobe_transport::rumqtt::RumqttClient;
use mqprobe_transport::{BrokerClient, BrokerEndpoint, EventReceiver};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "MQTT delivery-quality probe")]
pub struct Args {
	/// Path to the YAML configuration file
	#[arg(short = 'f', long = "file", env = CONFIG_ENV)]
	pub file: Option<PathBuf>,
}

impl Args {
	pub fn config(&self, role: Role) -> SessionConfig {
		let cfg = SessionConfig::load(self.file.as_deref(), role);
		info!(
			role = role.as_str(),
			label = %cfg.label,
			qos = %cfg.qos,
			tls = cfg.tls,
			broker = %format!("{}:{}", cfg.broker.host, cfg.broker.port),
			"configuration loaded"
		);
		cfg
	}
}

/// Install the fmt subscriber. `RUST_LOG` wins when set, otherwise `info`.
pub fn init_logging() {
	if std::env::var("RUST_LOG").is_err() {
		std::env::set_var("RUST_LOG", "info");
	}
	tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
}

/// Build the `rumqttc`-backed client for `cfg`.
pub fn broker_client(cfg: &SessionConfig) -> anyhow::Result<(Arc<dyn BrokerClient>, EventReceiver)> {
	let endpoint = BrokerEndpoint::from_config(cfg);
	let (client, events) = RumqttClient::new(&endpoint).context("invalid broker settings")?;
	Ok((Arc::new(client), events))
}

/// Write datasets and the summary under the configured output directory.
/// A session that ended early is still written, then reported as an error.
pub fn persist(cfg: &SessionConfig, report: &SessionReport) -> anyhow::Result<WrittenFiles> {
	let writer = SummaryWriter::new(cfg.output_dir.clone());
	let files = writer.write(report).with_context(|| format!("writing results under {}", writer.root().display()))?;
	if let Some(reason) = &report.stop_reason {
		anyhow::bail!("session ended early ({reason}); partial results in {}", files.summary.display());
	}
	Ok(files)
}
