//! Broker transport boundary.
//!
//! Session code talks to a broker only through [`BrokerClient`]. Everything
//! the broker tells us (connection established, acknowledgements, inbound
//! messages, drops, library log lines) arrives as a [`TransportEvent`] on the
//! receiver handed out when the client is built.
//!
//! - [`rumqtt::RumqttClient`] drives a real broker over TCP or websocket.
//! - [`mock::MockBroker`] is an in-process broker with a configurable link.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use mqprobe_core::{MessageId, QosLevel, SessionConfig, TransportKind};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mock;
pub mod rumqtt;

#[derive(Error, Debug)]
pub enum Error {
	#[error("connect failed: {0}")]
	Connect(String),
	#[error("not connected")]
	NotConnected,
	#[error("request rejected: {0}")]
	Request(String),
	#[error("invalid endpoint: {0}")]
	Endpoint(String),
}

impl Error {
	pub fn connect(msg: impl Into<String>) -> Self { Self::Connect(msg.into()) }
	pub fn request(msg: impl Into<String>) -> Self { Self::Request(msg.into()) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Something the broker link reported.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
	Connected,
	/// Broker accepted the message identified by the id `publish` returned.
	Acknowledged(MessageId),
	Received { topic: String, payload: Vec<u8>, qos: QosLevel },
	Disconnected { reason: String },
	/// Library diagnostics, re-emitted by the session at debug level.
	Log { message: String },
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Everything needed to reach the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerEndpoint {
	pub host: String,
	pub port: u16,
	pub transport: TransportKind,
	pub tls: bool,
	pub username: Option<String>,
	pub password: Option<String>,
	pub keepalive: std::time::Duration,
	pub client_id: String,
	pub persistent_session: bool,
}

impl BrokerEndpoint {
	pub fn from_config(cfg: &SessionConfig) -> Self {
		let b = &cfg.broker;
		Self {
			host: b.host.clone(),
			port: b.port,
			transport: b.transport,
			tls: cfg.tls,
			username: b.username.clone(),
			password: b.password.clone(),
			keepalive: b.keepalive,
			client_id: b.client_id.clone(),
			persistent_session: b.persistent_session,
		}
	}

	/// Websocket URL, path `/mqtt`.
	pub fn ws_url(&self) -> String {
		let scheme = if self.tls { "wss" } else { "ws" };
		format!("{scheme}://{}:{}/mqtt", self.host, self.port)
	}
}

impl From<&SessionConfig> for BrokerEndpoint {
	fn from(cfg: &SessionConfig) -> Self { Self::from_config(cfg) }
}

/// Handle to one broker session.
///
/// `connect` and `reconnect` return once the broker has accepted the
/// session, after emitting [`TransportEvent::Connected`]. Retrying is the
/// caller's job.
#[async_trait]
pub trait BrokerClient: Send + Sync {
	async fn connect(&self) -> Result<()>;

	async fn reconnect(&self) -> Result<()> { self.connect().await }

	/// Drop the session. A [`TransportEvent::Disconnected`] follows.
	async fn disconnect(&self) -> Result<()>;

	/// Submit a message. The returned id is echoed in the matching
	/// [`TransportEvent::Acknowledged`], which may arrive before this returns.
	async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QosLevel) -> Result<MessageId>;

	async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<()>;
}

#[cfg(test)]
mod tests {
	use super::*;
	use mqprobe_core::Role;

	#[test]
	fn endpoint_from_config() {
		let mut cfg = SessionConfig::defaults(Role::Subscriber);
		cfg.tls = true;
		cfg.broker.transport = TransportKind::Websocket;
		cfg.broker.port = 443;
		cfg.broker.host = "broker.example".into();
		let ep = BrokerEndpoint::from(&cfg);
		assert_eq!(ep.client_id, "mqprobe-sub");
		assert_eq!(ep.ws_url(), "wss://broker.example:443/mqtt");
		assert!(ep.persistent_session);
	}
}
