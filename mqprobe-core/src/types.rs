//! Records produced by a measurement session.
//!
//! "Unset" values are `None` in memory. On disk they use the historical `-1`
//! sentinel so existing dataset consumers keep working.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::clock::Millis;
use crate::error::{Error, Result};

/// Transport-assigned handle linking a submitted message to its acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mid={}", self.0)
    }
}

/// MQTT delivery guarantee level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QosLevel {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QosLevel {
    pub fn as_u8(self) -> u8 {
        match self {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QosLevel {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(Error::config(format!("qos must be 0, 1 or 2 (got {other})"))),
        }
    }
}

impl From<QosLevel> for u8 {
    fn from(q: QosLevel) -> u8 {
        q.as_u8()
    }
}

impl fmt::Display for QosLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Which end of the session this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Publisher,
    Subscriber,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Publisher => "publisher",
            Role::Subscriber => "subscriber",
        }
    }
}

/// Role-specific tag carried by each message record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Publisher side: submit time → broker acknowledgement.
    Publish,
    /// Subscriber side: sender's timestamp → local receipt.
    Receive,
}

/// One application-level message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(with = "sentinel::seq")]
    pub seq_num: Option<u64>,
    #[serde(with = "sentinel::millis")]
    pub send_time: Option<Millis>,
    #[serde(with = "sentinel::millis")]
    pub ack_time: Option<Millis>,
    #[serde(with = "sentinel::millis")]
    pub time_diff: Option<Millis>,
    pub qos: QosLevel,
    pub kind: RecordKind,
}

impl MessageRecord {
    /// Partial record created by the send path.
    pub fn sent(seq: u64, send_time: Millis, qos: QosLevel) -> Self {
        Self {
            seq_num: Some(seq),
            send_time: Some(send_time),
            ack_time: None,
            time_diff: None,
            qos,
            kind: RecordKind::Publish,
        }
    }

    /// Partial record created by an acknowledgement that beat the send path.
    pub fn acked(ack_time: Millis, qos: QosLevel) -> Self {
        Self {
            seq_num: None,
            send_time: None,
            ack_time: Some(ack_time),
            time_diff: None,
            qos,
            kind: RecordKind::Publish,
        }
    }

    /// Complete record for a message received by the subscriber.
    pub fn received(seq: u64, send_time: Millis, rcv_time: Millis, qos: QosLevel) -> Self {
        Self {
            seq_num: Some(seq),
            send_time: Some(send_time),
            ack_time: Some(rcv_time),
            time_diff: Some(rcv_time - send_time),
            qos,
            kind: RecordKind::Receive,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.time_diff.is_some()
    }

    /// Fill in the delay once both timestamps are known. Returns the delay.
    pub(crate) fn settle(&mut self) -> Option<Millis> {
        if let (Some(sent), Some(acked)) = (self.send_time, self.ack_time) {
            self.time_diff = Some(acked - sent);
        }
        self.time_diff
    }
}

/// One connect-or-reconnect cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionAttemptRecord {
    pub connect_time: Millis,
    pub connected_time: Millis,
    pub time_diff: Millis,
    pub tries: u32,
}

impl ConnectionAttemptRecord {
    pub fn new(connect_time: Millis, connected_time: Millis, tries: u32) -> Self {
        Self {
            connect_time,
            connected_time,
            time_diff: (connected_time - connect_time).max(0.0),
            tries: tries.max(1),
        }
    }
}

/// Boundary of a forced or observed disconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectEvent {
    #[serde(with = "sentinel::seq")]
    pub last_seq_num: Option<u64>,
    pub disconnect_time: Millis,
    #[serde(with = "sentinel::millis")]
    pub reconnect_time: Option<Millis>,
}

impl DisconnectEvent {
    pub fn new(last_seq_num: Option<u64>, disconnect_time: Millis) -> Self {
        Self { last_seq_num, disconnect_time, reconnect_time: None }
    }

    pub fn is_open(&self) -> bool {
        self.reconnect_time.is_none()
    }

    /// Close the gap. Clamped so that `reconnect_time >= disconnect_time`.
    pub fn close(&mut self, reconnect_time: Millis) {
        self.reconnect_time = Some(reconnect_time.max(self.disconnect_time));
    }
}

/// An entry in a session's record sequence: either a message or a
/// disconnect marker (persisted with `seq_num = -1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DatasetEntry {
    Disconnect(DisconnectMarker),
    Message(MessageRecord),
}

/// Serialized shape of a disconnect inside a message dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectMarker {
    #[serde(with = "sentinel::seq")]
    pub seq_num: Option<u64>,
    #[serde(flatten)]
    pub event: DisconnectEvent,
}

impl From<DisconnectEvent> for DatasetEntry {
    fn from(event: DisconnectEvent) -> Self {
        DatasetEntry::Disconnect(DisconnectMarker { seq_num: None, event })
    }
}

impl From<MessageRecord> for DatasetEntry {
    fn from(record: MessageRecord) -> Self {
        DatasetEntry::Message(record)
    }
}

impl DatasetEntry {
    pub fn as_message(&self) -> Option<&MessageRecord> {
        match self {
            DatasetEntry::Message(m) => Some(m),
            DatasetEntry::Disconnect(_) => None,
        }
    }

    pub fn as_disconnect(&self) -> Option<&DisconnectEvent> {
        match self {
            DatasetEntry::Disconnect(d) => Some(&d.event),
            DatasetEntry::Message(_) => None,
        }
    }
}

/// `-1` on the wire, `None` in memory.
pub mod sentinel {
    pub const UNSET: i64 = -1;

    pub mod millis {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(v: &Option<f64>, s: S) -> Result<S::Ok, S::Error> {
            match v {
                Some(x) => s.serialize_f64(*x),
                None => s.serialize_i64(super::UNSET),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
            let v = f64::deserialize(d)?;
            Ok(if v == super::UNSET as f64 { None } else { Some(v) })
        }
    }

    pub mod seq {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(v: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
            match v {
                Some(x) => s.serialize_u64(*x),
                None => s.serialize_i64(super::UNSET),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
            let v = i64::deserialize(d)?;
            Ok(u64::try_from(v).ok())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unset_fields_serialize_as_minus_one() {
        let rec = MessageRecord::sent(3, 1000.0, QosLevel::AtLeastOnce);
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["seq_num"], json!(3));
        assert_eq!(v["ack_time"], json!(-1));
        assert_eq!(v["time_diff"], json!(-1));
        assert_eq!(v["qos"], json!(1));
        assert_eq!(v.as_object().map(|o| o.len()), Some(6));
    }

    #[test]
    fn disconnect_marker_uses_sentinel_seq() {
        let entry: DatasetEntry = DisconnectEvent::new(Some(12), 5000.0).into();
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["seq_num"], json!(-1));
        assert_eq!(v["last_seq_num"], json!(12));
        assert_eq!(v["reconnect_time"], json!(-1));

        let back: DatasetEntry = serde_json::from_value(v).unwrap();
        assert!(back.as_disconnect().is_some_and(DisconnectEvent::is_open));
    }

    #[test]
    fn message_entry_deserializes_as_message() {
        let v = json!({"seq_num": 4, "send_time": 10.0, "ack_time": 12.5,
                       "time_diff": 2.5, "qos": 0, "kind": "receive"});
        let entry: DatasetEntry = serde_json::from_value(v).unwrap();
        assert_eq!(entry.as_message().and_then(|m| m.seq_num), Some(4));
    }

    #[test]
    fn qos_rejects_out_of_range() {
        assert!(QosLevel::try_from(3u8).is_err());
        assert!(serde_json::from_value::<QosLevel>(json!(2)).is_ok());
    }

    #[test]
    fn connection_attempt_clamps_invariants() {
        let rec = ConnectionAttemptRecord::new(100.0, 90.0, 0);
        assert_eq!(rec.tries, 1);
        assert_eq!(rec.time_diff, 0.0);
    }

    #[test]
    fn disconnect_close_never_precedes_disconnect() {
        let mut ev = DisconnectEvent::new(None, 500.0);
        ev.close(499.0);
        assert_eq!(ev.reconnect_time, Some(500.0));
    }
}
