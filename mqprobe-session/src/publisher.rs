//! Publisher session driver.
//!
//! Sends `total_packets` sequenced messages on a fixed interval and measures
//! the time from submission to broker acknowledgement. A pump task plays the
//! acknowledgement callback: it drains transport events and completes records
//! in the shared [`CorrelationTable`] while the driver sleeps between sends.

use std::sync::Arc;
use std::time::Duration;

use mqprobe_core::{CorrelationTable, DatasetEntry, MessageRecord, Payload, Role, SessionConfig};
use mqprobe_transport::{BrokerClient, EventReceiver, TransportEvent};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::connection::ConnectionManager;
use crate::error::{Result, SessionError};
use crate::fault::FaultInjector;
use crate::retry::Backoff;
use crate::state::{SessionPhase, SessionState};
use crate::summary::{stamp_now, SessionReport};

const ACK_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct Publisher {
	config: SessionConfig,
	state: Arc<SessionState>,
	table: Arc<CorrelationTable>,
	conn: ConnectionManager,
	backoff: Backoff,
	events: Option<EventReceiver>,
	fault_seed: Option<u64>,
}

impl Publisher {
	pub fn new(config: SessionConfig, client: Arc<dyn BrokerClient>, events: EventReceiver) -> Self {
		let state = Arc::new(SessionState::new(mqprobe_core::Clock::new()));
		let backoff = Backoff::from(&config.retry);
		let conn = ConnectionManager::new(client, backoff, *state.clock());
		Self { config, state, table: Arc::new(CorrelationTable::new()), conn, backoff, events: Some(events), fault_seed: None }
	}

	/// Seed the fault injector's generator for reproducible runs.
	pub fn with_fault_seed(mut self, seed: u64) -> Self {
		self.fault_seed = Some(seed);
		self
	}

	pub fn state(&self) -> &Arc<SessionState> { &self.state }

	pub async fn run(mut self) -> Result<SessionReport> {
		let start_time = stamp_now();
		let events = self.events.take().ok_or_else(|| SessionError::internal("publisher already ran"))?;
		let (cancel_tx, cancel_rx) = watch::channel(false);
		let pump = spawn_pump(events, Arc::clone(&self.table), Arc::clone(&self.state), cancel_rx.clone());

		self.state.transition(SessionPhase::Connecting)?;
		self.conn.connect().await?;
		self.state.set_connected(true);
		self.state.transition(SessionPhase::Ready)?;

		let injector = self.config.fault.enabled().then(|| {
			let inj = match self.fault_seed {
				Some(seed) => FaultInjector::with_seed(self.config.fault, seed),
				None => FaultInjector::new(self.config.fault),
			};
			inj.spawn(Arc::clone(self.conn.client()), Arc::clone(&self.state), cancel_rx.clone())
		});
		self.state.transition(SessionPhase::Active)?;

		let stop_reason = match self.exchange().await {
			Ok(()) => None,
			Err(e @ SessionError::RetriesExhausted { .. }) => {
				error!(error = %e, "broker unreachable, ending session early");
				Some(e.to_string())
			}
			Err(e) => return Err(e),
		};

		self.state.transition(SessionPhase::Draining)?;
		let _ = cancel_tx.send(true);
		join(injector, "fault injector").await;
		join(Some(pump), "event pump").await;
		self.state.transition(SessionPhase::Closed)?;

		let mut report = SessionReport::new(Role::Publisher, &self.config, start_time);
		report.disconnects = self.state.disconnects();
		report.dataset = interleave(self.table.drain(), self.state.take_entries());
		report.connections = self.conn.attempts();
		report.stop_reason = stop_reason;
		Ok(report)
	}

	async fn exchange(&self) -> Result<()> {
		let total = self.config.total_packets;
		for seq in 1..=total {
			self.publish_seq(seq).await?;
			if seq < total {
				tokio::time::sleep(self.config.send_interval).await;
			}
		}
		self.await_acks().await
	}

	/// Submit one sequence number, re-submitting under the same number until
	/// the transport takes it.
	async fn publish_seq(&self, seq: u64) -> Result<()> {
		let mut failures = 0u32;
		loop {
			if !self.state.is_connected() {
				self.recover().await?;
			}
			let send_time = self.state.now_ms();
			let payload = Payload::new(seq, send_time).encode();
			match self.conn.client().publish(&self.config.topic, payload, self.config.qos).await {
				Ok(mid) => {
					self.table.record_send(mid, seq, send_time, self.config.qos);
					self.state.note_seq(seq);
					info!("message {} with seq num {seq} is published", mid.0);
					return Ok(());
				}
				Err(e) => {
					failures += 1;
					let delay = self.backoff.delay(failures);
					warn!(seq, failures, error = %e, ?delay, "publish failed, retrying with same sequence number");
					if matches!(e, mqprobe_transport::Error::NotConnected) {
						self.state.set_connected(false);
					}
					tokio::time::sleep(delay).await;
				}
			}
		}
	}

	/// Wait until every sequence number is acknowledged, reconnecting if the
	/// link drops meanwhile. Gives up after `ack_wait_timeout` when set.
	async fn await_acks(&self) -> Result<()> {
		let total = self.config.total_packets as usize;
		let deadline = self.config.ack_wait_timeout.map(|d| Instant::now() + d);
		loop {
			let acked = self.table.completed();
			if acked >= total {
				info!(acked, "all messages acknowledged");
				return Ok(());
			}
			if deadline.is_some_and(|d| Instant::now() >= d) {
				warn!(acked, total, "acknowledgement wait timed out");
				return Ok(());
			}
			if !self.state.is_connected() {
				self.recover().await?;
			}
			trace!(acked, total, "waiting for acknowledgements");
			tokio::time::sleep(ACK_POLL_INTERVAL).await;
		}
	}

	async fn recover(&self) -> Result<()> {
		if matches!(self.state.phase(), SessionPhase::Active | SessionPhase::Ready) {
			self.state.transition(SessionPhase::Faulted)?;
		}
		self.state.open_disconnect(self.state.now_ms());
		if let Some(delay) = self.config.reconnect_delay {
			tokio::time::sleep(delay).await;
		}
		self.state.transition(SessionPhase::Connecting)?;
		self.conn.reconnect().await?;
		self.state.close_disconnect(self.state.now_ms());
		self.state.set_connected(true);
		self.state.transition(SessionPhase::Ready)?;
		self.state.transition(SessionPhase::Active)?;
		Ok(())
	}
}

fn spawn_pump(mut events: EventReceiver, table: Arc<CorrelationTable>, state: Arc<SessionState>, mut cancel: watch::Receiver<bool>) -> JoinHandle<()> {
	tokio::spawn(async move {
		loop {
			let event = tokio::select! {
				biased;
				ev = events.recv() => ev,
				_ = cancel.changed() => break,
			};
			match event {
				Some(TransportEvent::Acknowledged(mid)) => {
					if let Some(diff) = table.record_ack(mid, state.now_ms()) {
						debug!(%mid, delay_ms = diff, "publish acknowledged");
					}
				}
				Some(TransportEvent::Disconnected { reason }) => {
					warn!(%reason, "disconnected from broker");
					state.open_disconnect(state.now_ms());
					state.set_connected(false);
				}
				Some(TransportEvent::Connected) => debug!("broker session established"),
				Some(TransportEvent::Log { message }) => debug!(target: "mqprobe::transport", "{message}"),
				Some(TransportEvent::Received { topic, .. }) => trace!(%topic, "ignoring inbound message"),
				None => break,
			}
		}
	})
}

async fn join<T>(handle: Option<JoinHandle<T>>, what: &str) {
	if let Some(h) = handle {
		if let Err(e) = h.await {
			warn!(task = what, error = %e, "background task ended abnormally");
		}
	}
}

/// Message records by sequence number, each disconnect marker placed after
/// the last message sent before it.
fn interleave(messages: Vec<MessageRecord>, markers: Vec<DatasetEntry>) -> Vec<DatasetEntry> {
	let mut out = Vec::with_capacity(messages.len() + markers.len());
	let mut markers = markers.into_iter().filter(|e| e.as_disconnect().is_some()).peekable();
	for msg in messages {
		let seq = msg.seq_num.unwrap_or(u64::MAX);
		while let Some(m) = markers.next_if(|m| m.as_disconnect().and_then(|d| d.last_seq_num).unwrap_or(0) < seq) {
			out.push(m);
		}
		out.push(msg.into());
	}
	out.extend(markers);
	out
}
