//! Send/acknowledge reconciliation.
//!
//! The send path and the acknowledgement path race: a fast broker can
//! acknowledge a message before the sender has recorded its send time. Both
//! sides go through [`CorrelationTable`], and whichever arrives second
//! completes the record. Each call is a single check-then-write under one
//! lock that is never held across I/O.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::clock::Millis;
use crate::types::{MessageId, MessageRecord, QosLevel};

#[derive(Debug, Default)]
pub struct CorrelationTable {
	inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	records: HashMap<MessageId, MessageRecord>,
	completed: usize,
}

impl CorrelationTable {
	pub fn new() -> Self { Self::default() }

	/// Send-path write. Returns the delay if this call completed the record.
	pub fn record_send(&self, id: MessageId, seq: u64, send_time: Millis, qos: QosLevel) -> Option<Millis> {
		let mut g = self.inner.lock();
		let Inner { records, completed } = &mut *g;
		match records.get_mut(&id) {
			Some(rec) if rec.send_time.is_none() => {
				rec.seq_num = Some(seq);
				rec.send_time = Some(send_time);
				rec.qos = qos;
				let diff = rec.settle();
				if diff.is_some() {
					*completed += 1;
				}
				trace!(%id, seq, "send completed ack-first record");
				diff
			}
			Some(_) => {
				debug!(%id, seq, "duplicate send for identifier ignored");
				None
			}
			None => {
				records.insert(id, MessageRecord::sent(seq, send_time, qos));
				None
			}
		}
	}

	/// Acknowledgement-path write. Returns the delay if this call completed
	/// the record. A repeated acknowledgement leaves the record untouched.
	pub fn record_ack(&self, id: MessageId, ack_time: Millis) -> Option<Millis> {
		let mut g = self.inner.lock();
		let Inner { records, completed } = &mut *g;
		match records.get_mut(&id) {
			Some(rec) if rec.ack_time.is_none() => {
				rec.ack_time = Some(ack_time);
				let diff = rec.settle();
				if diff.is_some() {
					*completed += 1;
				}
				diff
			}
			Some(_) => {
				debug!(%id, "duplicate acknowledgement ignored");
				None
			}
			None => {
				trace!(%id, "acknowledgement arrived before send was recorded");
				records.insert(id, MessageRecord::acked(ack_time, QosLevel::default()));
				None
			}
		}
	}

	/// Number of records with both timestamps set.
	pub fn completed(&self) -> usize { self.inner.lock().completed }

	pub fn len(&self) -> usize { self.inner.lock().records.len() }

	pub fn is_empty(&self) -> bool { self.len() == 0 }

	pub fn get(&self, id: MessageId) -> Option<MessageRecord> { self.inner.lock().records.get(&id).cloned() }

	/// Take every record out of the table, ordered by sequence number.
	/// Partial records without a sequence number sort last.
	pub fn drain(&self) -> Vec<MessageRecord> {
		let mut g = self.inner.lock();
		g.completed = 0;
		let mut out: Vec<MessageRecord> = g.records.drain().map(|(_, r)| r).collect();
		drop(g);
		out.sort_by_key(|r| (r.seq_num.is_none(), r.seq_num));
		out
	}
}
