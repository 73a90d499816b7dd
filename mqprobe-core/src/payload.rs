//! Test payload codec: ASCII `"<seq> <send_time_ms>"`.

use crate::clock::Millis;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Payload {
	pub seq: u64,
	pub send_time: Millis,
}

impl Payload {
	pub fn new(seq: u64, send_time: Millis) -> Self { Self { seq, send_time } }

	pub fn encode(&self) -> Vec<u8> {
		format!("{} {:.3}", self.seq, self.send_time).into_bytes()
	}

	pub fn decode(bytes: &[u8]) -> Result<Self> {
		let text = std::str::from_utf8(bytes).map_err(|e| Error::payload(format!("not utf-8: {e}")))?;
		let mut parts = text.split_whitespace();
		let seq = parts
			.next()
			.ok_or_else(|| Error::payload("empty payload"))?
			.parse::<u64>()
			.map_err(|e| Error::payload(format!("bad sequence number: {e}")))?;
		let send_time = parts
			.next()
			.ok_or_else(|| Error::payload("missing send timestamp"))?
			.parse::<f64>()
			.map_err(|e| Error::payload(format!("bad send timestamp: {e}")))?;
		if !send_time.is_finite() {
			return Err(Error::payload("send timestamp is not finite"));
		}
		if parts.next().is_some() {
			return Err(Error::payload("trailing fields"));
		}
		Ok(Self { seq, send_time })
	}
}
