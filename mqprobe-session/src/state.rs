//! Session phases and the state shared between a driver and its background
//! tasks.

use std::sync::atomic::{AtomicU64, Ordering};

use mqprobe_core::{Clock, DatasetEntry, DisconnectEvent, Millis, MessageRecord};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
	Disconnected,
	Connecting,
	Ready,
	Active,
	Faulted,
	Draining,
	Closed,
}

impl SessionPhase {
	pub fn can_transition(self, to: SessionPhase) -> bool {
		use SessionPhase::*;
		matches!(
			(self, to),
			(Disconnected, Connecting)
				| (Connecting, Ready)
				| (Ready, Active)
				| (Ready, Faulted)
				| (Active, Faulted)
				| (Faulted, Connecting)
				| (Connecting | Ready | Active | Faulted, Draining)
				| (Draining, Closed)
		)
	}
}

/// Everything a session's tasks share. Each accessor takes its lock for one
/// step only; no lock here is ever held across an `.await`.
#[derive(Debug)]
pub struct SessionState {
	clock: Clock,
	phase: Mutex<SessionPhase>,
	/// Message records and disconnect markers in arrival order.
	entries: Mutex<Vec<DatasetEntry>>,
	/// 0 means nothing sent or received yet.
	last_seq: AtomicU64,
	connected: watch::Sender<bool>,
}

impl SessionState {
	pub fn new(clock: Clock) -> Self {
		let (connected, _) = watch::channel(false);
		Self {
			clock,
			phase: Mutex::new(SessionPhase::Disconnected),
			entries: Mutex::new(Vec::new()),
			last_seq: AtomicU64::new(0),
			connected,
		}
	}

	pub fn clock(&self) -> &Clock { &self.clock }

	pub fn now_ms(&self) -> Millis { self.clock.now_ms() }

	pub fn phase(&self) -> SessionPhase { *self.phase.lock() }

	pub fn transition(&self, to: SessionPhase) -> Result<()> {
		let mut phase = self.phase.lock();
		let from = *phase;
		if !from.can_transition(to) {
			return Err(SessionError::InvalidTransition { from, to });
		}
		*phase = to;
		drop(phase);
		info!(?from, ?to, "session phase change");
		Ok(())
	}

	pub fn is_connected(&self) -> bool { *self.connected.borrow() }

	pub fn set_connected(&self, up: bool) { self.connected.send_replace(up); }

	pub fn watch_connected(&self) -> watch::Receiver<bool> { self.connected.subscribe() }

	pub fn note_seq(&self, seq: u64) { self.last_seq.fetch_max(seq, Ordering::SeqCst); }

	pub fn last_seq(&self) -> Option<u64> {
		match self.last_seq.load(Ordering::SeqCst) {
			0 => None,
			s => Some(s),
		}
	}

	pub fn push_message(&self, record: MessageRecord) {
		if let Some(seq) = record.seq_num {
			self.note_seq(seq);
		}
		self.entries.lock().push(record.into());
	}

	/// Record the start of a gap unless one is already open.
	/// Returns whether a new event was opened.
	pub fn open_disconnect(&self, at: Millis) -> bool {
		let mut entries = self.entries.lock();
		if open_event(&mut entries).is_some() {
			return false;
		}
		let event = DisconnectEvent::new(self.last_seq(), at);
		debug!(last_seq = ?event.last_seq_num, at, "disconnect recorded");
		entries.push(event.into());
		true
	}

	/// Close the most recent open gap. Returns false if none was open.
	pub fn close_disconnect(&self, at: Millis) -> bool {
		let mut entries = self.entries.lock();
		match open_event(&mut entries) {
			Some(ev) => {
				ev.close(at);
				true
			}
			None => false,
		}
	}

	/// Drop the open gap, for a disconnect that never happened.
	pub fn discard_open_disconnect(&self) {
		let mut entries = self.entries.lock();
		if let Some(pos) = entries.iter().rposition(|e| e.as_disconnect().is_some_and(DisconnectEvent::is_open)) {
			entries.remove(pos);
		}
	}

	pub fn disconnects(&self) -> Vec<DisconnectEvent> {
		self.entries.lock().iter().filter_map(|e| e.as_disconnect().cloned()).collect()
	}

	pub fn entries(&self) -> Vec<DatasetEntry> { self.entries.lock().clone() }

	pub fn take_entries(&self) -> Vec<DatasetEntry> { std::mem::take(&mut *self.entries.lock()) }
}

fn open_event(entries: &mut [DatasetEntry]) -> Option<&mut DisconnectEvent> {
	entries.iter_mut().rev().find_map(|e| match e {
		DatasetEntry::Disconnect(m) if m.event.is_open() => Some(&mut m.event),
		_ => None,
	})
}
