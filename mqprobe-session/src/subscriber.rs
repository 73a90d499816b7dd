//! Subscriber session driver.
//!
//! Receive-driven: every inbound test message becomes a complete record with
//! its end-to-end delay. Runs until the shutdown future resolves. Dropped
//! links, forced or not, are reconnected promptly and the gap is recorded.

use std::future::Future;
use std::sync::Arc;

use mqprobe_core::{Clock, MessageRecord, Payload, QosLevel, Role, SessionConfig};
use mqprobe_transport::{BrokerClient, EventReceiver, TransportEvent};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::connection::ConnectionManager;
use crate::error::{Result, SessionError};
use crate::fault::FaultInjector;
use crate::retry::Backoff;
use crate::state::{SessionPhase, SessionState};
use crate::summary::{stamp_now, SessionReport};

pub struct Subscriber {
	config: SessionConfig,
	state: Arc<SessionState>,
	conn: ConnectionManager,
	events: EventReceiver,
	fault_seed: Option<u64>,
}

/// Whether the receive loop should keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
	Continue,
	Shutdown,
}

impl Subscriber {
	pub fn new(config: SessionConfig, client: Arc<dyn BrokerClient>, events: EventReceiver) -> Self {
		let state = Arc::new(SessionState::new(Clock::new()));
		let conn = ConnectionManager::new(client, Backoff::from(&config.retry), *state.clock());
		Self { config, state, conn, events, fault_seed: None }
	}

	pub fn with_fault_seed(mut self, seed: u64) -> Self {
		self.fault_seed = Some(seed);
		self
	}

	pub fn state(&self) -> &Arc<SessionState> { &self.state }

	/// Run until `shutdown` resolves, then stop the fault injector and hand
	/// back everything recorded.
	pub async fn run<F>(mut self, shutdown: F) -> Result<SessionReport>
	where
		F: Future<Output = ()>,
	{
		let start_time = stamp_now();
		tokio::pin!(shutdown);
		let (cancel_tx, cancel_rx) = watch::channel(false);
		let mut injector = None;
		let mut stop_reason = None;

		self.state.transition(SessionPhase::Connecting)?;
		let connected = tokio::select! {
			r = self.conn.connect() => { r?; true }
			_ = &mut shutdown => false,
		};

		if connected {
			self.state.set_connected(true);
			self.state.transition(SessionPhase::Ready)?;
			if self.config.fault.enabled() {
				let inj = match self.fault_seed {
					Some(seed) => FaultInjector::with_seed(self.config.fault, seed),
					None => FaultInjector::new(self.config.fault),
				};
				injector = Some(inj.spawn(Arc::clone(self.conn.client()), Arc::clone(&self.state), cancel_rx));
			}
			self.state.transition(SessionPhase::Active)?;

			loop {
				let event = tokio::select! {
					_ = &mut shutdown => break,
					ev = self.events.recv() => ev,
				};
				let Some(event) = event else {
					let e = SessionError::ChannelClosed;
					error!(error = %e, "ending session early");
					stop_reason = Some(e.to_string());
					break;
				};
				match self.handle(event, &mut shutdown).await {
					Ok(Flow::Continue) => {}
					Ok(Flow::Shutdown) => break,
					Err(e @ SessionError::RetriesExhausted { .. }) => {
						error!(error = %e, "broker unreachable, ending session early");
						stop_reason = Some(e.to_string());
						break;
					}
					Err(e) => return Err(e),
				}
			}
		}

		info!("shutting down subscriber");
		self.state.transition(SessionPhase::Draining)?;
		let _ = cancel_tx.send(true);
		if let Some(handle) = injector {
			match handle.await {
				Ok(forced) => debug!(forced, "fault injector joined"),
				Err(e) => warn!(error = %e, "fault injector ended abnormally"),
			}
		}
		self.state.transition(SessionPhase::Closed)?;

		let mut report = SessionReport::new(Role::Subscriber, &self.config, start_time);
		report.disconnects = self.state.disconnects();
		report.dataset = self.state.take_entries();
		report.connections = self.conn.attempts();
		report.stop_reason = stop_reason;
		Ok(report)
	}

	async fn handle<S>(&mut self, event: TransportEvent, shutdown: &mut S) -> Result<Flow>
	where
		S: Future<Output = ()> + Unpin,
	{
		match event {
			TransportEvent::Connected => {
				// Subscribing on every connect renews the subscription after a drop.
				if let Err(e) = self.conn.client().subscribe(&self.config.topic, self.config.qos).await {
					warn!(error = %e, topic = %self.config.topic, "subscribe failed");
				} else {
					info!(topic = %self.config.topic, qos = %self.config.qos, "subscribed");
				}
			}
			TransportEvent::Received { topic, payload, qos } => self.on_message(&topic, &payload, qos),
			TransportEvent::Disconnected { reason } => return self.recover(&reason, shutdown).await,
			TransportEvent::Acknowledged(mid) => trace!(%mid, "acknowledged"),
			TransportEvent::Log { message } => debug!(target: "mqprobe::transport", "{message}"),
		}
		Ok(Flow::Continue)
	}

	fn on_message(&self, topic: &str, payload: &[u8], qos: QosLevel) {
		let rcv_time = self.state.now_ms();
		if topic != self.config.topic {
			trace!(%topic, "message on unrelated topic");
			return;
		}
		match Payload::decode(payload) {
			Ok(p) => {
				let record = MessageRecord::received(p.seq, p.send_time, rcv_time, qos);
				debug!(seq = p.seq, delay_ms = ?record.time_diff, "message received");
				self.state.push_message(record);
			}
			Err(e) => warn!(error = %e, "skipping malformed payload"),
		}
	}

	async fn recover<S>(&mut self, reason: &str, shutdown: &mut S) -> Result<Flow>
	where
		S: Future<Output = ()> + Unpin,
	{
		warn!(%reason, "disconnected from broker");
		self.state.open_disconnect(self.state.now_ms());
		self.state.set_connected(false);
		match self.state.phase() {
			SessionPhase::Active | SessionPhase::Ready => self.state.transition(SessionPhase::Faulted)?,
			other => return Err(SessionError::InvalidTransition { from: other, to: SessionPhase::Faulted }),
		}

		if let Some(delay) = self.config.reconnect_delay {
			tokio::select! {
				_ = tokio::time::sleep(delay) => {}
				_ = &mut *shutdown => return Ok(Flow::Shutdown),
			}
		}

		self.state.transition(SessionPhase::Connecting)?;
		tokio::select! {
			r = self.conn.reconnect() => { r?; }
			_ = &mut *shutdown => return Ok(Flow::Shutdown),
		}
		let now = self.state.now_ms();
		if !self.state.close_disconnect(now) {
			debug!("reconnected with no open gap");
		}
		self.state.set_connected(true);
		self.state.transition(SessionPhase::Ready)?;
		self.state.transition(SessionPhase::Active)?;
		Ok(Flow::Continue)
	}
}
