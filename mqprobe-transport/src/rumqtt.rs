//! [`BrokerClient`] over `rumqttc`.
//!
//! `rumqttc` does not hand back a packet id from `publish`, and QoS 0 messages
//! never get one. The adapter therefore assigns its own [`MessageId`] per
//! publish and pairs it with the `Outgoing::Publish` event the event loop
//! emits for that request. Requests leave the event loop in submission
//! order, so a FIFO of pending ids is enough. QoS 0 counts as acknowledged
//! when written to the socket; QoS 1 on PUBACK, QoS 2 on PUBCOMP.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mqprobe_core::{MessageId, QosLevel, TransportKind};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::{BrokerClient, BrokerEndpoint, Error, EventReceiver, EventSender, Result, TransportEvent};

/// Bound on requests queued inside `rumqttc` while the link is down.
const REQUEST_CAPACITY: usize = 1024;

pub struct RumqttClient {
	client: AsyncClient,
	/// `None` while the pump task owns the event loop.
	eventloop: tokio::sync::Mutex<Option<EventLoop>>,
	pump: Mutex<Option<JoinHandle<EventLoop>>>,
	alive: Arc<AtomicBool>,
	inflight: Arc<Inflight>,
	publish_order: tokio::sync::Mutex<()>,
	events: EventSender,
}

impl RumqttClient {
	pub fn new(endpoint: &BrokerEndpoint) -> Result<(Self, EventReceiver)> {
		let options = mqtt_options(endpoint)?;
		let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
		let (tx, rx) = mpsc::unbounded_channel();
		Ok((
			Self {
				client,
				eventloop: tokio::sync::Mutex::new(Some(eventloop)),
				pump: Mutex::new(None),
				alive: Arc::new(AtomicBool::new(false)),
				inflight: Arc::new(Inflight::default()),
				publish_order: tokio::sync::Mutex::new(()),
				events: tx,
			},
			rx,
		))
	}

	/// Recover the event loop from a pump that has stopped.
	async fn reclaim(&self, slot: &mut Option<EventLoop>) -> Result<bool> {
		if slot.is_some() {
			return Ok(true);
		}
		if self.alive.load(Ordering::SeqCst) {
			return Ok(false);
		}
		let handle = self.pump.lock().take();
		match handle {
			Some(h) => {
				let el = h.await.map_err(|e| Error::connect(format!("event pump aborted: {e}")))?;
				*slot = Some(el);
				Ok(true)
			}
			None => Err(Error::connect("event loop lost")),
		}
	}
}

#[async_trait]
impl BrokerClient for RumqttClient {
	async fn connect(&self) -> Result<()> {
		let mut slot = self.eventloop.lock().await;
		if !self.reclaim(&mut slot).await? {
			debug!("connect requested while already connected");
			return Ok(());
		}
		let Some(mut eventloop) = slot.take() else {
			return Err(Error::connect("event loop lost"));
		};
		loop {
			match eventloop.poll().await {
				Ok(Event::Incoming(Packet::ConnAck(ack))) => {
					info!(code = ?ack.code, session_present = ack.session_present, "broker accepted session");
					break;
				}
				Ok(other) => self.inflight.on_event(other, &self.events),
				Err(e) => {
					*slot = Some(eventloop);
					return Err(Error::connect(e.to_string()));
				}
			}
		}
		self.alive.store(true, Ordering::SeqCst);
		let _ = self.events.send(TransportEvent::Connected);
		let handle = tokio::spawn(pump(eventloop, Arc::clone(&self.inflight), Arc::clone(&self.alive), self.events.clone()));
		*self.pump.lock() = Some(handle);
		Ok(())
	}

	async fn disconnect(&self) -> Result<()> {
		if !self.alive.load(Ordering::SeqCst) {
			return Err(Error::NotConnected);
		}
		self.client.disconnect().await.map_err(|e| Error::request(e.to_string()))
	}

	async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QosLevel) -> Result<MessageId> {
		let _order = self.publish_order.lock().await;
		let mid = self.inflight.enqueue(qos);
		if let Err(e) = self.client.publish(topic, to_qos(qos), false, payload).await {
			self.inflight.cancel(mid);
			return Err(Error::request(e.to_string()));
		}
		Ok(mid)
	}

	async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<()> {
		self.client.subscribe(topic, to_qos(qos)).await.map_err(|e| Error::request(e.to_string()))
	}
}

/// Drive the event loop until the link drops, then hand it back for reuse.
async fn pump(mut eventloop: EventLoop, inflight: Arc<Inflight>, alive: Arc<AtomicBool>, events: EventSender) -> EventLoop {
	let reason = loop {
		match eventloop.poll().await {
			Ok(Event::Outgoing(Outgoing::Disconnect)) => break "client requested disconnect".to_string(),
			Ok(event) => inflight.on_event(event, &events),
			Err(e) => break e.to_string(),
		}
	};
	// Drops the socket and moves unacknowledged packets to the resend queue.
	eventloop.clean();
	alive.store(false, Ordering::SeqCst);
	warn!(%reason, "broker link down");
	let _ = events.send(TransportEvent::Disconnected { reason });
	eventloop
}

#[derive(Debug, Default)]
struct Inflight {
	inner: Mutex<InflightInner>,
}

#[derive(Debug, Default)]
struct InflightInner {
	next_mid: u64,
	queued: VecDeque<(MessageId, QosLevel)>,
	by_pkid: HashMap<u16, MessageId>,
}

impl Inflight {
	fn enqueue(&self, qos: QosLevel) -> MessageId {
		let mut g = self.inner.lock();
		g.next_mid += 1;
		let mid = MessageId(g.next_mid);
		g.queued.push_back((mid, qos));
		mid
	}

	fn cancel(&self, mid: MessageId) {
		self.inner.lock().queued.retain(|(m, _)| *m != mid);
	}

	fn on_event(&self, event: Event, events: &EventSender) {
		match event {
			Event::Outgoing(Outgoing::Publish(pkid)) => {
				let mut g = self.inner.lock();
				if pkid != 0 && g.by_pkid.contains_key(&pkid) {
					trace!(pkid, "retransmission");
					return;
				}
				match g.queued.pop_front() {
					Some((mid, QosLevel::AtMostOnce)) => {
						drop(g);
						let _ = events.send(TransportEvent::Acknowledged(mid));
					}
					Some((mid, _)) => {
						g.by_pkid.insert(pkid, mid);
					}
					None => warn!(pkid, "outgoing publish with no pending message id"),
				}
			}
			Event::Incoming(Packet::PubAck(ack)) => self.settle(ack.pkid, events),
			Event::Incoming(Packet::PubComp(comp)) => self.settle(comp.pkid, events),
			Event::Incoming(Packet::Publish(p)) => {
				let _ = events.send(TransportEvent::Received { topic: p.topic, payload: p.payload.to_vec(), qos: from_qos(p.qos) });
			}
			other => {
				let _ = events.send(TransportEvent::Log { message: format!("{other:?}") });
			}
		}
	}

	fn settle(&self, pkid: u16, events: &EventSender) {
		let mid = self.inner.lock().by_pkid.remove(&pkid);
		match mid {
			Some(mid) => {
				let _ = events.send(TransportEvent::Acknowledged(mid));
			}
			None => debug!(pkid, "acknowledgement for unknown packet id"),
		}
	}
}

fn mqtt_options(ep: &BrokerEndpoint) -> Result<MqttOptions> {
	if ep.client_id.is_empty() || ep.client_id.starts_with(' ') {
		return Err(Error::Endpoint(format!("invalid client id {:?}", ep.client_id)));
	}
	if !ep.keepalive.is_zero() && ep.keepalive.as_secs() == 0 {
		return Err(Error::Endpoint("keepalive must be whole seconds".into()));
	}
	let mut o = match ep.transport {
		TransportKind::Tcp => MqttOptions::new(ep.client_id.clone(), ep.host.clone(), ep.port),
		TransportKind::Websocket => MqttOptions::new(ep.client_id.clone(), ep.ws_url(), ep.port),
	};
	o.set_keep_alive(ep.keepalive);
	o.set_clean_session(!ep.persistent_session);
	if let (Some(user), Some(pass)) = (&ep.username, &ep.password) {
		o.set_credentials(user.clone(), pass.clone());
	}
	let transport = match (ep.transport, ep.tls) {
		(TransportKind::Tcp, false) => Transport::Tcp,
		(TransportKind::Tcp, true) => Transport::tls_with_default_config(),
		(TransportKind::Websocket, false) => Transport::Ws,
		(TransportKind::Websocket, true) => Transport::wss_with_default_config(),
	};
	o.set_transport(transport);
	Ok(o)
}

fn to_qos(q: QosLevel) -> QoS {
	match q {
		QosLevel::AtMostOnce => QoS::AtMostOnce,
		QosLevel::AtLeastOnce => QoS::AtLeastOnce,
		QosLevel::ExactlyOnce => QoS::ExactlyOnce,
	}
}

fn from_qos(q: QoS) -> QosLevel {
	match q {
		QoS::AtMostOnce => QosLevel::AtMostOnce,
		QoS::AtLeastOnce => QosLevel::AtLeastOnce,
		QoS::ExactlyOnce => QosLevel::ExactlyOnce,
	}
}
