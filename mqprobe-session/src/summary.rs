//! Persistence of raw datasets and per-role summaries.
//!
//! Layout under the output directory:
//!
//! ```text
//! data/<pub|pub-conn|sub|sub-conn>/<stamp>_qos-<q>_netcond-<label>.json
//! summary/<label>.json            written by the publisher
//! summary/<stamp>_<label>.json    publisher + subscriber, written by the subscriber
//! ```
//!
//! Every file goes through a temporary sibling and a rename, so readers see
//! either the old document or the new one.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use mqprobe_core::{
	loss_ratio, summarize, ConnectionAttemptRecord, DatasetEntry, DisconnectEvent, Field, QosLevel, Role, SessionConfig, StatsError, SummaryStatistics,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::Result;

/// Timestamp format used in file names and `start_time`.
pub const STAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

pub fn stamp_now() -> String { Local::now().format(STAMP_FORMAT).to_string() }

/// Everything a finished session hands to the writer.
#[derive(Debug, Clone)]
pub struct SessionReport {
	pub role: Role,
	pub start_time: String,
	pub label: String,
	pub qos: QosLevel,
	pub tls: bool,
	pub total_packets: u64,
	/// Message records (and, for the subscriber, disconnect markers) in order.
	pub dataset: Vec<DatasetEntry>,
	pub connections: Vec<ConnectionAttemptRecord>,
	pub disconnects: Vec<DisconnectEvent>,
	/// Why the session ended early, if it did. Records up to that point are
	/// still in the report.
	pub stop_reason: Option<String>,
}

impl SessionReport {
	pub fn new(role: Role, config: &SessionConfig, start_time: String) -> Self {
		Self {
			role,
			start_time,
			label: config.label.clone(),
			qos: config.qos,
			tls: config.tls,
			total_packets: config.total_packets,
			dataset: Vec::new(),
			connections: Vec::new(),
			disconnects: Vec::new(),
			stop_reason: None,
		}
	}

	pub fn completed(&self) -> bool { self.stop_reason.is_none() }

	pub fn delay_stats(&self) -> Result<SummaryStatistics, StatsError> { summarize(&self.dataset, Field::TimeDiff) }

	/// Distinct sequence numbers with a complete record.
	pub fn received(&self) -> usize {
		self.dataset
			.iter()
			.filter_map(DatasetEntry::as_message)
			.filter(|m| m.is_complete())
			.filter_map(|m| m.seq_num)
			.collect::<BTreeSet<_>>()
			.len()
	}

	pub fn loss(&self) -> Result<f64, StatsError> { loss_ratio(self.total_packets, self.received()) }
}

/// One role's section of the summary document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleSummary {
	pub start_time: String,
	pub label: String,
	pub tls: bool,
	pub qos: QosLevel,
	pub pkt_sent: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub pkt_recv: Option<usize>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub pkt_loss: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub pub_delay: Option<SummaryStatistics>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub pub_data_file: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub e2e_delay: Option<SummaryStatistics>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub e2e_data_file: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub conn_delay: Option<SummaryStatistics>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub conn_tries: Option<SummaryStatistics>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub conn_data_file: Option<String>,
	pub disconnects: usize,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stop_reason: Option<String>,
}

/// Paths produced by [`SummaryWriter::write`].
#[derive(Debug, Clone)]
pub struct WrittenFiles {
	pub dataset: PathBuf,
	pub connections: PathBuf,
	pub summary: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SummaryWriter {
	root: PathBuf,
	stamp: String,
}

impl SummaryWriter {
	pub fn new(root: impl Into<PathBuf>) -> Self { Self::with_stamp(root, stamp_now()) }

	pub fn with_stamp(root: impl Into<PathBuf>, stamp: impl Into<String>) -> Self { Self { root: root.into(), stamp: stamp.into() } }

	pub fn root(&self) -> &Path { &self.root }

	/// Relative path of a dataset file.
	pub fn dataset_name(&self, subfolder: &str, qos: QosLevel, label: &str) -> String {
		format!("data/{subfolder}/{}_qos-{qos}_netcond-{label}.json", self.stamp)
	}

	pub fn summary_path(&self, label: &str) -> PathBuf { self.root.join("summary").join(format!("{label}.json")) }

	pub fn stamped_summary_path(&self, label: &str) -> PathBuf { self.root.join("summary").join(format!("{}_{label}.json", self.stamp)) }

	pub fn write_dataset<T: Serialize>(&self, subfolder: &str, qos: QosLevel, label: &str, data: &[T]) -> Result<String> {
		let rel = self.dataset_name(subfolder, qos, label);
		write_json(&self.root.join(&rel), &data)?;
		Ok(rel)
	}

	/// Persist both datasets and merge this role's section into the summary.
	///
	/// The publisher writes `summary/<label>.json`. The subscriber reads that
	/// file if present, adds its own section, writes the stamped name and
	/// removes the unstamped one.
	pub fn write(&self, report: &SessionReport) -> Result<WrittenFiles> {
		let (data_dir, conn_dir, section) = match report.role {
			Role::Publisher => ("pub", "pub-conn", "publisher"),
			Role::Subscriber => ("sub", "sub-conn", "subscriber"),
		};
		let dataset = self.write_dataset(data_dir, report.qos, &report.label, &report.dataset)?;
		let connections = self.write_dataset(conn_dir, report.qos, &report.label, &report.connections)?;
		let summary = build_summary(report, &dataset, &connections);

		let unstamped = self.summary_path(&report.label);
		let mut doc = read_summary(&unstamped);
		doc.insert(section.to_string(), serde_json::to_value(&summary)?);

		let target = match report.role {
			Role::Publisher => unstamped.clone(),
			Role::Subscriber => self.stamped_summary_path(&report.label),
		};
		write_json(&target, &Value::Object(doc))?;
		if report.role == Role::Subscriber {
			match std::fs::remove_file(&unstamped) {
				Ok(()) => {}
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
				Err(e) => return Err(e.into()),
			}
		}
		info!(summary = %target.display(), dataset = %dataset, "results written");

		Ok(WrittenFiles { dataset: self.root.join(dataset), connections: self.root.join(connections), summary: target })
	}
}

pub fn build_summary(report: &SessionReport, dataset_file: &str, conn_file: &str) -> RoleSummary {
	let delay = report.delay_stats().map_err(|e| warn!(role = report.role.as_str(), error = %e, "no delay statistics")).ok();
	let conn_delay = summarize(&report.connections, Field::TimeDiff).ok();
	let conn_tries = summarize(&report.connections, Field::Tries).ok();
	let has_conn = conn_delay.is_some();

	let mut s = RoleSummary {
		start_time: report.start_time.clone(),
		label: report.label.clone(),
		tls: report.tls,
		qos: report.qos,
		pkt_sent: report.total_packets,
		pkt_recv: None,
		pkt_loss: None,
		pub_delay: None,
		pub_data_file: None,
		e2e_delay: None,
		e2e_data_file: None,
		conn_delay,
		conn_tries,
		conn_data_file: has_conn.then(|| conn_file.to_string()),
		disconnects: report.disconnects.len(),
		stop_reason: report.stop_reason.clone(),
	};
	match report.role {
		Role::Publisher => {
			s.pub_delay = delay;
			s.pub_data_file = Some(dataset_file.to_string());
		}
		Role::Subscriber => {
			s.e2e_delay = delay;
			s.e2e_data_file = Some(dataset_file.to_string());
			s.pkt_recv = Some(report.received());
			s.pkt_loss = report.loss().ok();
		}
	}
	s
}

/// Existing summary document, or an empty one if missing or unreadable.
fn read_summary(path: &Path) -> Map<String, Value> {
	let text = match std::fs::read_to_string(path) {
		Ok(t) => t,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Map::new(),
		Err(e) => {
			warn!(path = %path.display(), error = %e, "cannot read existing summary, starting fresh");
			return Map::new();
		}
	};
	match serde_json::from_str::<Value>(&text) {
		Ok(Value::Object(map)) => map,
		Ok(_) | Err(_) => {
			warn!(path = %path.display(), "existing summary is not a JSON object, starting fresh");
			Map::new()
		}
	}
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
	let dir = path.parent().unwrap_or(Path::new("."));
	std::fs::create_dir_all(dir)?;
	let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
	serde_json::to_writer(&mut tmp, value)?;
	tmp.flush()?;
	tmp.persist(path).map_err(|e| e.error)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use mqprobe_core::MessageRecord;

	fn report(role: Role) -> SessionReport {
		let mut cfg = SessionConfig::defaults(role);
		cfg.label = "lossy".into();
		cfg.total_packets = 4;
		let mut r = SessionReport::new(role, &cfg, "2024-01-01_00-00-00".into());
		r.dataset = vec![
			MessageRecord::received(1, 0.0, 10.0, QosLevel::AtMostOnce).into(),
			DisconnectEvent::new(Some(1), 50.0).into(),
			MessageRecord::received(2, 0.0, 20.0, QosLevel::AtMostOnce).into(),
			MessageRecord::received(2, 0.0, 30.0, QosLevel::AtMostOnce).into(),
		];
		r.connections = vec![ConnectionAttemptRecord::new(0.0, 4.0, 1)];
		r
	}

	#[test]
	fn duplicates_do_not_count_as_received() {
		let r = report(Role::Subscriber);
		assert_eq!(r.received(), 2);
		assert_eq!(r.loss(), Ok(0.5));
	}

	#[test]
	fn publisher_then_subscriber_merge() {
		let dir = tempfile::tempdir().unwrap();
		let writer = SummaryWriter::with_stamp(dir.path(), "2024-01-01_00-00-10");

		let pub_files = writer.write(&report(Role::Publisher)).unwrap();
		assert_eq!(pub_files.summary, dir.path().join("summary/lossy.json"));
		assert!(dir.path().join("data/pub/2024-01-01_00-00-10_qos-0_netcond-lossy.json").exists());
		assert!(dir.path().join("data/pub-conn/2024-01-01_00-00-10_qos-0_netcond-lossy.json").exists());

		let sub_files = writer.write(&report(Role::Subscriber)).unwrap();
		assert_eq!(sub_files.summary, dir.path().join("summary/2024-01-01_00-00-10_lossy.json"));
		assert!(!dir.path().join("summary/lossy.json").exists());

		let doc: Value = serde_json::from_str(&std::fs::read_to_string(&sub_files.summary).unwrap()).unwrap();
		assert_eq!(doc["publisher"]["pub_delay"]["count"], 3);
		assert_eq!(doc["subscriber"]["pkt_recv"], 2);
		assert_eq!(doc["subscriber"]["pkt_loss"], 0.5);
		assert_eq!(doc["subscriber"]["disconnects"], 0);
		assert_eq!(doc["subscriber"]["e2e_data_file"], "data/sub/2024-01-01_00-00-10_qos-0_netcond-lossy.json");
		assert_eq!(doc["subscriber"]["conn_tries"]["max"], 1.0);

		let raw: Value = serde_json::from_str(&std::fs::read_to_string(&sub_files.dataset).unwrap()).unwrap();
		assert_eq!(raw[1]["seq_num"], -1);
		assert_eq!(raw[1]["last_seq_num"], 1);
	}

	#[test]
	fn corrupt_publisher_summary_is_tolerated() {
		let dir = tempfile::tempdir().unwrap();
		let writer = SummaryWriter::with_stamp(dir.path(), "s");
		std::fs::create_dir_all(dir.path().join("summary")).unwrap();
		std::fs::write(writer.summary_path("lossy"), "{not json").unwrap();
		let files = writer.write(&report(Role::Subscriber)).unwrap();
		let doc: Value = serde_json::from_str(&std::fs::read_to_string(files.summary).unwrap()).unwrap();
		assert!(doc.get("publisher").is_none());
		assert!(doc.get("subscriber").is_some());
	}

	#[test]
	fn empty_dataset_omits_delay() {
		let mut r = report(Role::Publisher);
		r.dataset.clear();
		r.connections.clear();
		let s = build_summary(&r, "d", "c");
		assert!(s.pub_delay.is_none());
		assert!(s.conn_data_file.is_none());
		let v = serde_json::to_value(&s).unwrap();
		assert!(v.get("pub_delay").is_none());
		assert!(v.get("stop_reason").is_none());
		assert_eq!(v["pkt_sent"], 4);
	}

	#[test]
	fn early_stop_is_summarized() {
		let mut r = report(Role::Subscriber);
		r.stop_reason = Some("gave up connecting after 2 attempts: refused".into());
		assert!(!r.completed());
		let v = serde_json::to_value(build_summary(&r, "d", "c")).unwrap();
		assert_eq!(v["stop_reason"], "gave up connecting after 2 attempts: refused");
		assert_eq!(v["pkt_recv"], 2);
	}
}
