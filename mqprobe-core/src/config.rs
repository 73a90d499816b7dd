//! Per-run configuration.
//!
//! A YAML file carries up to three sections: `publisher`, `subscriber` and
//! `shared`. The effective configuration for a role is
//! `defaults <- role section <- shared`, so `shared` wins on conflicts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{QosLevel, Role};

/// Environment variable naming the config file when no flag is given.
pub const CONFIG_ENV: &str = "MQPROBE_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
	#[default]
	Tcp,
	#[serde(alias = "websockets", alias = "ws")]
	Websocket,
}

impl TransportKind {
	/// Port used when the file does not name one.
	pub fn default_port(self, tls: bool) -> u16 {
		match (self, tls) {
			(TransportKind::Tcp, false) => 1883,
			(TransportKind::Tcp, true) => 8883,
			(TransportKind::Websocket, false) => 80,
			(TransportKind::Websocket, true) => 443,
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
	pub host: String,
	pub port: u16,
	pub transport: TransportKind,
	pub username: Option<String>,
	pub password: Option<String>,
	pub keepalive: Duration,
	pub client_id: String,
	/// Persistent session: the broker keeps subscriptions and queued QoS>0
	/// messages across a disconnect.
	pub persistent_session: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaultConfig {
	/// Chance in [0,1] that a tick forces a disconnect. 0 disables injection.
	pub probability: f64,
	pub interval: Duration,
	pub duration: Duration,
}

impl FaultConfig {
	pub fn enabled(&self) -> bool { self.probability > 0.0 }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
	pub base_delay: Duration,
	pub max_delay: Duration,
	/// `None` retries forever.
	pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
	pub role: Role,
	pub qos: QosLevel,
	pub tls: bool,
	pub label: String,
	pub total_packets: u64,
	pub fault: FaultConfig,
	pub broker: BrokerConfig,
	pub topic: String,
	pub send_interval: Duration,
	pub retry: RetryConfig,
	pub reconnect_delay: Option<Duration>,
	pub ack_wait_timeout: Option<Duration>,
	pub output_dir: PathBuf,
}

/// On-disk layout.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
	#[serde(default)]
	pub publisher: Option<ConfigOverlay>,
	#[serde(default)]
	pub subscriber: Option<ConfigOverlay>,
	#[serde(default)]
	pub shared: Option<ConfigOverlay>,
}

/// One section of the file. Every key is optional; absent keys leave the
/// value underneath untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigOverlay {
	pub qos: Option<u8>,
	pub tls: Option<bool>,
	pub label: Option<String>,
	pub total_packets: Option<u64>,
	pub disconnect_perc: Option<f64>,
	pub disconnect_interval: Option<f64>,
	pub disconnect_duration: Option<f64>,
	pub broker: Option<BrokerOverlay>,
	pub topic: Option<String>,
	pub send_interval_ms: Option<u64>,
	pub retry: Option<RetryOverlay>,
	pub reconnect_delay_secs: Option<f64>,
	pub ack_wait_timeout_secs: Option<f64>,
	pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerOverlay {
	pub host: Option<String>,
	pub port: Option<u16>,
	pub transport: Option<TransportKind>,
	pub username: Option<String>,
	pub password: Option<String>,
	pub keepalive_secs: Option<u64>,
	pub client_id: Option<String>,
	pub persistent_session: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryOverlay {
	pub base_delay_ms: Option<u64>,
	pub max_delay_ms: Option<u64>,
	pub max_attempts: Option<u32>,
}

impl SessionConfig {
	pub fn defaults(role: Role) -> Self {
		let client_id = match role {
			Role::Publisher => "mqprobe-pub",
			Role::Subscriber => "mqprobe-sub",
		};
		Self {
			role,
			qos: QosLevel::AtMostOnce,
			tls: false,
			label: "normal".into(),
			total_packets: 50,
			fault: FaultConfig {
				probability: 0.0,
				interval: Duration::from_secs(10),
				duration: Duration::from_secs(10),
			},
			broker: BrokerConfig {
				host: "localhost".into(),
				port: TransportKind::Tcp.default_port(false),
				transport: TransportKind::Tcp,
				username: Some("test".into()),
				password: Some("test".into()),
				keepalive: Duration::from_secs(60),
				client_id: client_id.into(),
				persistent_session: true,
			},
			topic: "test".into(),
			send_interval: Duration::from_millis(1000),
			retry: RetryConfig {
				base_delay: Duration::from_millis(100),
				max_delay: Duration::from_secs(5),
				max_attempts: None,
			},
			reconnect_delay: None,
			ack_wait_timeout: None,
			output_dir: PathBuf::from("."),
		}
	}

	/// Load the configuration for `role`. Never fails: any problem with the
	/// file is logged and the defaults are used instead.
	pub fn load(path: Option<&Path>, role: Role) -> Self {
		let Some(path) = path else {
			return Self::defaults(role);
		};
		match Self::try_load(path, role) {
			Ok(cfg) => cfg,
			Err(e) => {
				warn!(path = %path.display(), error = %e, "config unusable, using default values");
				Self::defaults(role)
			}
		}
	}

	pub fn try_load(path: impl AsRef<Path>, role: Role) -> Result<Self> {
		let data = std::fs::read_to_string(path.as_ref())?;
		Self::from_yaml_str(&data, role)
	}

	pub fn from_yaml_str(data: &str, role: Role) -> Result<Self> {
		// An empty document parses as unit, not as an empty mapping.
		let file: ConfigFile = if data.trim().is_empty() {
			ConfigFile::default()
		} else {
			serde_yaml::from_str(data)?
		};
		Self::from_file(file, role)
	}

	pub fn from_file(file: ConfigFile, role: Role) -> Result<Self> {
		let mut cfg = Self::defaults(role);
		let section = match role {
			Role::Publisher => file.publisher,
			Role::Subscriber => file.subscriber,
		};
		let mut port = None;
		for overlay in [section, file.shared].into_iter().flatten() {
			if let Some(p) = overlay.broker.as_ref().and_then(|b| b.port) {
				port = Some(p);
			}
			cfg.apply(overlay)?;
		}
		cfg.broker.port = port.unwrap_or_else(|| cfg.broker.transport.default_port(cfg.tls));
		cfg.validate()?;
		debug!(role = role.as_str(), label = %cfg.label, qos = %cfg.qos, "configuration resolved");
		Ok(cfg)
	}

	fn apply(&mut self, o: ConfigOverlay) -> Result<()> {
		if let Some(q) = o.qos { self.qos = QosLevel::try_from(q)?; }
		if let Some(v) = o.tls { self.tls = v; }
		if let Some(v) = o.label { self.label = v; }
		if let Some(v) = o.total_packets { self.total_packets = v; }
		if let Some(v) = o.disconnect_perc { self.fault.probability = v; }
		if let Some(v) = o.disconnect_interval { self.fault.interval = secs("disconnect_interval", v)?; }
		if let Some(v) = o.disconnect_duration { self.fault.duration = secs("disconnect_duration", v)?; }
		if let Some(v) = o.topic { self.topic = v; }
		if let Some(v) = o.send_interval_ms { self.send_interval = Duration::from_millis(v); }
		if let Some(v) = o.reconnect_delay_secs { self.reconnect_delay = Some(secs("reconnect_delay_secs", v)?); }
		if let Some(v) = o.ack_wait_timeout_secs { self.ack_wait_timeout = Some(secs("ack_wait_timeout_secs", v)?); }
		if let Some(v) = o.output_dir { self.output_dir = v; }
		if let Some(b) = o.broker {
			if let Some(v) = b.host { self.broker.host = v; }
			if let Some(v) = b.transport { self.broker.transport = v; }
			if let Some(v) = b.username { self.broker.username = Some(v); }
			if let Some(v) = b.password { self.broker.password = Some(v); }
			if let Some(v) = b.keepalive_secs { self.broker.keepalive = Duration::from_secs(v); }
			if let Some(v) = b.client_id { self.broker.client_id = v; }
			if let Some(v) = b.persistent_session { self.broker.persistent_session = v; }
		}
		if let Some(r) = o.retry {
			if let Some(v) = r.base_delay_ms { self.retry.base_delay = Duration::from_millis(v); }
			if let Some(v) = r.max_delay_ms { self.retry.max_delay = Duration::from_millis(v); }
			if let Some(v) = r.max_attempts { self.retry.max_attempts = Some(v); }
		}
		Ok(())
	}

	pub fn validate(&self) -> Result<()> {
		let p = self.fault.probability;
		if !(0.0..=1.0).contains(&p) {
			return Err(Error::config(format!("disconnect_perc must be within [0,1] (got {p})")));
		}
		if self.fault.interval.is_zero() {
			return Err(Error::config("disconnect_interval must be positive"));
		}
		if self.total_packets == 0 {
			return Err(Error::config("total_packets must be positive"));
		}
		if self.send_interval.is_zero() {
			return Err(Error::config("send_interval_ms must be positive"));
		}
		if self.topic.is_empty() {
			return Err(Error::config("topic must not be empty"));
		}
		if self.retry.max_attempts == Some(0) {
			return Err(Error::config("retry.max_attempts must be at least 1"));
		}
		if self.retry.base_delay > self.retry.max_delay {
			return Err(Error::config("retry.base_delay_ms exceeds retry.max_delay_ms"));
		}
		Ok(())
	}
}

fn secs(key: &str, v: f64) -> Result<Duration> {
	if !v.is_finite() || v < 0.0 {
		return Err(Error::config(format!("{key} must be a non-negative number of seconds (got {v})")));
	}
	Ok(Duration::from_secs_f64(v))
}
