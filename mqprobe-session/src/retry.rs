#![forbid(unsafe_code)]

//! Exponential backoff with jitter for connect and publish retries.

use std::time::Duration;

use mqprobe_core::RetryConfig;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
	base: Duration,
	max: Duration,
	max_attempts: Option<u32>,
}

impl Backoff {
	pub fn new(base: Duration, max: Duration, max_attempts: Option<u32>) -> Self {
		Self { base, max: max.max(base), max_attempts }
	}

	/// Whether another attempt may follow `attempts` failed ones.
	pub fn allows(&self, attempts: u32) -> bool {
		self.max_attempts.map_or(true, |cap| attempts < cap)
	}

	/// Delay before attempt `attempt + 1`: half the capped exponential step
	/// plus a uniform share of the other half.
	pub fn delay(&self, attempt: u32) -> Duration {
		let base_ms = self.base.as_millis().min(u64::MAX as u128) as u64;
		let max_ms = self.max.as_millis().min(u64::MAX as u128) as u64;
		let pow = 1u64 << attempt.saturating_sub(1).min(16);
		let capped = base_ms.saturating_mul(pow).min(max_ms);
		let half = capped / 2;
		let jitter = if half == 0 { 0 } else { rand::thread_rng().gen_range(0..=half) };
		Duration::from_millis(half + jitter)
	}
}

impl From<&RetryConfig> for Backoff {
	fn from(cfg: &RetryConfig) -> Self { Self::new(cfg.base_delay, cfg.max_delay, cfg.max_attempts) }
}
