//! In-process broker for tests and dry runs.
//!
//! Clients of one [`MockBroker`] share topic routing and persistent sessions.
//! The [`LinkProfile`] shapes every hop: acknowledgement delay, delivery
//! latency with uniform jitter, QoS 0 loss and refused connects. Sessions are
//! persistent: QoS>0 traffic addressed to a disconnected client is parked and
//! handed over on its next connect, QoS 0 traffic is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mqprobe_core::{MessageId, QosLevel};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{BrokerClient, Error, EventReceiver, EventSender, Result, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkProfile {
	/// Publish to acknowledgement, as seen by the publisher.
	pub ack_delay: Duration,
	/// Publish to delivery, as seen by subscribers.
	pub delivery_latency: Duration,
	/// Uniform extra delivery delay in `[0, jitter]`.
	pub jitter: Duration,
	/// Probability in [0,1] that a QoS 0 message never reaches subscribers.
	pub loss: f64,
	pub connect_latency: Duration,
	/// Number of connect attempts refused before the broker accepts one.
	pub connect_failures: u32,
}

impl Default for LinkProfile {
	fn default() -> Self {
		Self {
			ack_delay: Duration::ZERO,
			delivery_latency: Duration::ZERO,
			jitter: Duration::ZERO,
			loss: 0.0,
			connect_latency: Duration::ZERO,
			connect_failures: 0,
		}
	}
}

/// Counters for assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
	pub published: u64,
	pub delivered: u64,
	pub dropped: u64,
	pub parked: u64,
	pub connects: u64,
	pub refused: u64,
	/// Publishes turned away by [`MockBroker::refuse_publishes`].
	pub rejected: u64,
}

#[derive(Clone)]
pub struct MockBroker {
	inner: Arc<Inner>,
}

struct Inner {
	profile: LinkProfile,
	rng: Mutex<StdRng>,
	state: Mutex<BrokerState>,
}

struct BrokerState {
	sessions: HashMap<String, Session>,
	refusals_left: u32,
	publish_refusals_left: u32,
	stats: BrokerStats,
}

struct Session {
	events: EventSender,
	connected: bool,
	subscriptions: Vec<(String, QosLevel)>,
	parked: Vec<TransportEvent>,
}

impl MockBroker {
	pub fn new(profile: LinkProfile, seed: u64) -> Self {
		Self {
			inner: Arc::new(Inner {
				profile,
				rng: Mutex::new(StdRng::seed_from_u64(seed)),
				state: Mutex::new(BrokerState {
					sessions: HashMap::new(),
					refusals_left: profile.connect_failures,
					publish_refusals_left: 0,
					stats: BrokerStats::default(),
				}),
			}),
		}
	}

	/// Open a client handle. Reusing a client id takes over its session
	/// (subscriptions and parked messages) with a fresh event channel.
	pub fn client(&self, client_id: impl Into<String>) -> (MockClient, EventReceiver) {
		let client_id = client_id.into();
		let (tx, rx) = mpsc::unbounded_channel();
		{
			let mut st = self.inner.state.lock();
			let session = st.sessions.entry(client_id.clone()).or_insert_with(|| Session {
				events: tx.clone(),
				connected: false,
				subscriptions: Vec::new(),
				parked: Vec::new(),
			});
			session.events = tx;
			session.connected = false;
		}
		(MockClient { broker: Arc::clone(&self.inner), client_id, next_mid: AtomicU64::new(0) }, rx)
	}

	/// Drop a client's link from the broker side, as a network failure would.
	pub fn drop_link(&self, client_id: &str) -> bool {
		let mut st = self.inner.state.lock();
		match st.sessions.get_mut(client_id) {
			Some(s) if s.connected => {
				s.connected = false;
				let _ = s.events.send(TransportEvent::Disconnected { reason: "link dropped".into() });
				true
			}
			_ => false,
		}
	}

	/// Refuse the next `n` connect attempts from any client.
	pub fn refuse_connects(&self, n: u32) { self.inner.state.lock().refusals_left = n; }

	/// Reject the next `n` publish requests from any client. The link stays up.
	pub fn refuse_publishes(&self, n: u32) { self.inner.state.lock().publish_refusals_left = n; }

	pub fn is_connected(&self, client_id: &str) -> bool {
		self.inner.state.lock().sessions.get(client_id).is_some_and(|s| s.connected)
	}

	pub fn stats(&self) -> BrokerStats { self.inner.state.lock().stats }
}

pub struct MockClient {
	broker: Arc<Inner>,
	client_id: String,
	next_mid: AtomicU64,
}

impl MockClient {
	pub fn client_id(&self) -> &str { &self.client_id }
}

#[async_trait]
impl BrokerClient for MockClient {
	async fn connect(&self) -> Result<()> {
		let latency = self.broker.profile.connect_latency;
		if !latency.is_zero() {
			tokio::time::sleep(latency).await;
		}
		let mut st = self.broker.state.lock();
		if st.refusals_left > 0 {
			st.refusals_left -= 1;
			st.stats.refused += 1;
			return Err(Error::connect("connection refused by mock broker"));
		}
		st.stats.connects += 1;
		let session = st.sessions.get_mut(&self.client_id).ok_or_else(|| Error::connect("unknown client"))?;
		session.connected = true;
		let _ = session.events.send(TransportEvent::Connected);
		let parked = std::mem::take(&mut session.parked);
		let n = parked.len();
		for ev in parked {
			let _ = session.events.send(ev);
		}
		if n > 0 {
			st.stats.delivered += n as u64;
			debug!(client = %self.client_id, n, "handed over parked messages");
		}
		Ok(())
	}

	async fn disconnect(&self) -> Result<()> {
		let mut st = self.broker.state.lock();
		match st.sessions.get_mut(&self.client_id) {
			Some(s) if s.connected => {
				s.connected = false;
				let _ = s.events.send(TransportEvent::Disconnected { reason: "client requested disconnect".into() });
				Ok(())
			}
			_ => Err(Error::NotConnected),
		}
	}

	async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QosLevel) -> Result<MessageId> {
		let mid = MessageId(self.next_mid.fetch_add(1, Ordering::Relaxed) + 1);
		let profile = self.broker.profile;
		let targets: Vec<(String, QosLevel, Duration)> = {
			let mut st = self.broker.state.lock();
			if !st.sessions.get(&self.client_id).is_some_and(|s| s.connected) {
				return Err(Error::NotConnected);
			}
			if st.publish_refusals_left > 0 {
				st.publish_refusals_left -= 1;
				st.stats.rejected += 1;
				return Err(Error::request("publish rejected by mock broker"));
			}
			st.stats.published += 1;
			let mut rng = self.broker.rng.lock();
			if qos == QosLevel::AtMostOnce && profile.loss > 0.0 && rng.gen::<f64>() < profile.loss {
				st.stats.dropped += 1;
				trace!(%mid, "lost on the link");
				Vec::new()
			} else {
				st.sessions
					.iter()
					.filter_map(|(id, s)| {
						s.subscriptions
							.iter()
							.find(|(filter, _)| topic_matches(filter, topic))
							.map(|(_, sub_qos)| (id.clone(), min_qos(qos, *sub_qos)))
					})
					.collect::<Vec<_>>()
					.into_iter()
					.map(|(id, q)| (id, q, profile.delivery_latency + jitter(&mut rng, profile.jitter)))
					.collect()
			}
		};

		schedule(Arc::clone(&self.broker), self.client_id.clone(), profile.ack_delay, TransportEvent::Acknowledged(mid), qos);
		for (id, effective, delay) in targets {
			let ev = TransportEvent::Received { topic: topic.to_string(), payload: payload.clone(), qos: effective };
			schedule(Arc::clone(&self.broker), id, delay, ev, effective);
		}
		Ok(mid)
	}

	async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<()> {
		let mut st = self.broker.state.lock();
		let session = match st.sessions.get_mut(&self.client_id) {
			Some(s) if s.connected => s,
			_ => return Err(Error::NotConnected),
		};
		match session.subscriptions.iter_mut().find(|(f, _)| f == topic) {
			Some(existing) => existing.1 = qos,
			None => session.subscriptions.push((topic.to_string(), qos)),
		}
		Ok(())
	}
}

fn schedule(broker: Arc<Inner>, client_id: String, delay: Duration, event: TransportEvent, qos: QosLevel) {
	if delay.is_zero() {
		deliver(&broker, &client_id, event, qos);
		return;
	}
	tokio::spawn(async move {
		tokio::time::sleep(delay).await;
		deliver(&broker, &client_id, event, qos);
	});
}

fn deliver(broker: &Inner, client_id: &str, event: TransportEvent, qos: QosLevel) {
	let mut st = broker.state.lock();
	let BrokerState { sessions, stats, .. } = &mut *st;
	let Some(session) = sessions.get_mut(client_id) else {
		stats.dropped += 1;
		return;
	};
	if session.connected {
		let _ = session.events.send(event);
		stats.delivered += 1;
	} else if qos != QosLevel::AtMostOnce {
		session.parked.push(event);
		stats.parked += 1;
	} else {
		stats.dropped += 1;
	}
}

fn jitter(rng: &mut StdRng, max: Duration) -> Duration {
	if max.is_zero() {
		return Duration::ZERO;
	}
	let us = max.as_micros().min(u64::MAX as u128) as u64;
	Duration::from_micros(rng.gen_range(0..=us))
}

fn min_qos(a: QosLevel, b: QosLevel) -> QosLevel {
	if a.as_u8() <= b.as_u8() { a } else { b }
}

/// MQTT filter match with `+` and trailing `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
	let mut f = filter.split('/');
	let mut t = topic.split('/');
	loop {
		match (f.next(), t.next()) {
			(Some("#"), _) => return true,
			(Some("+"), Some(_)) => {}
			(Some(a), Some(b)) if a == b => {}
			(None, None) => return true,
			_ => return false,
		}
	}
}
