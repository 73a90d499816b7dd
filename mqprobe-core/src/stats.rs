//! Reduction of timestamped records into summary distributions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ConnectionAttemptRecord, DatasetEntry, MessageRecord};

#[derive(Debug, Error, PartialEq)]
pub enum StatsError {
	#[error("no eligible records to summarize")]
	Empty,
	#[error("configured total is zero")]
	ZeroTotal,
}

/// Numeric fields a record may expose for aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
	TimeDiff,
	Tries,
}

/// Anything [`summarize`] can reduce. Disconnect markers and incomplete
/// records return `None` and are skipped.
pub trait Sample {
	fn value(&self, field: Field) -> Option<f64>;
}

impl Sample for MessageRecord {
	fn value(&self, field: Field) -> Option<f64> {
		match field {
			Field::TimeDiff => self.time_diff,
			Field::Tries => None,
		}
	}
}

impl Sample for ConnectionAttemptRecord {
	fn value(&self, field: Field) -> Option<f64> {
		match field {
			Field::TimeDiff => Some(self.time_diff),
			Field::Tries => Some(f64::from(self.tries)),
		}
	}
}

impl Sample for DatasetEntry {
	fn value(&self, field: Field) -> Option<f64> {
		self.as_message().and_then(|m| m.value(field))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryStatistics {
	pub count: usize,
	pub min: f64,
	pub max: f64,
	pub mean: f64,
	pub std_dev: f64,
	pub median: f64,
}

/// Count, extrema, mean, median and sample standard deviation of `field`
/// over the eligible records. A single sample has a standard deviation of 0.
pub fn summarize<'a, T, I>(records: I, field: Field) -> Result<SummaryStatistics, StatsError>
where
	T: Sample + 'a,
	I: IntoIterator<Item = &'a T>,
{
	let mut values: Vec<f64> = records
		.into_iter()
		.filter_map(|r| r.value(field))
		.filter(|v| v.is_finite())
		.collect();
	if values.is_empty() {
		return Err(StatsError::Empty);
	}
	values.sort_by(f64::total_cmp);

	let count = values.len();
	let n = count as f64;
	let mean = values.iter().sum::<f64>() / n;
	let median = if count % 2 == 1 {
		values[count / 2]
	} else {
		(values[count / 2 - 1] + values[count / 2]) / 2.0
	};
	let std_dev = if count > 1 {
		let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
		(ss / (n - 1.0)).sqrt()
	} else {
		0.0
	};

	Ok(SummaryStatistics { count, min: values[0], max: values[count - 1], mean, std_dev, median })
}

/// `(total - received) / total`, clamped to [0,1].
pub fn loss_ratio(total: u64, received: usize) -> Result<f64, StatsError> {
	if total == 0 {
		return Err(StatsError::ZeroTotal);
	}
	let lost = total.saturating_sub(received as u64);
	Ok((lost as f64 / total as f64).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{DisconnectEvent, QosLevel};
	use proptest::prelude::*;

	fn rec(seq: u64, diff: f64) -> MessageRecord { MessageRecord::received(seq, 1000.0, 1000.0 + diff, QosLevel::AtMostOnce) }

	#[test]
	fn basic_summary() {
		let recs: Vec<_> = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0].iter().enumerate().map(|(i, d)| rec(i as u64, *d)).collect();
		let s = summarize(&recs, Field::TimeDiff).unwrap();
		assert_eq!(s.count, 8);
		assert_eq!(s.min, 2.0);
		assert_eq!(s.max, 9.0);
		assert_eq!(s.mean, 5.0);
		assert_eq!(s.median, 4.5);
		assert!((s.std_dev - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
	}

	#[test]
	fn single_sample_has_zero_deviation() {
		let s = summarize(&[rec(1, 3.0)], Field::TimeDiff).unwrap();
		assert_eq!(s.std_dev, 0.0);
		assert_eq!(s.median, 3.0);
	}

	#[test]
	fn empty_and_incomplete_input_is_an_error() {
		let none: Vec<MessageRecord> = Vec::new();
		assert_eq!(summarize(&none, Field::TimeDiff), Err(StatsError::Empty));
		let partial = vec![MessageRecord::sent(1, 5.0, QosLevel::AtMostOnce)];
		assert_eq!(summarize(&partial, Field::TimeDiff), Err(StatsError::Empty));
	}

	#[test]
	fn disconnect_markers_are_skipped() {
		let entries: Vec<DatasetEntry> = vec![
			rec(1, 10.0).into(),
			DisconnectEvent::new(Some(1), 2000.0).into(),
			rec(2, 20.0).into(),
		];
		let s = summarize(&entries, Field::TimeDiff).unwrap();
		assert_eq!(s.count, 2);
		assert_eq!(s.mean, 15.0);
	}

	#[test]
	fn connection_tries() {
		let conns = vec![ConnectionAttemptRecord::new(0.0, 5.0, 1), ConnectionAttemptRecord::new(10.0, 30.0, 3)];
		let s = summarize(&conns, Field::Tries).unwrap();
		assert_eq!((s.min, s.max, s.mean), (1.0, 3.0, 2.0));
		let d = summarize(&conns, Field::TimeDiff).unwrap();
		assert_eq!(d.mean, 12.5);
	}

	#[test]
	fn loss_fifty_forty_five() {
		assert_eq!(loss_ratio(50, 45), Ok(0.1));
		assert_eq!(loss_ratio(50, 60), Ok(0.0));
		assert_eq!(loss_ratio(0, 0), Err(StatsError::ZeroTotal));
	}

	proptest! {
		#[test]
		fn ordering_and_mean(values in proptest::collection::vec(0.0f64..1e5, 1..200)) {
			let recs: Vec<_> = values.iter().enumerate().map(|(i, d)| rec(i as u64, *d)).collect();
			let s = summarize(&recs, Field::TimeDiff).unwrap();
			prop_assert_eq!(s.count, values.len());
			prop_assert!(s.min <= s.median && s.median <= s.max);
			let expect = recs.iter().filter_map(|r| r.time_diff).sum::<f64>() / values.len() as f64;
			prop_assert!((s.mean - expect).abs() <= 1e-6 * expect.abs().max(1.0));
			prop_assert!(s.std_dev >= 0.0);
		}
	}
}
