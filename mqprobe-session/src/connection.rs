//! Connect and reconnect loops with attempt accounting.

use std::sync::Arc;

use mqprobe_core::{Clock, ConnectionAttemptRecord};
use mqprobe_transport::BrokerClient;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{Result, SessionError};
use crate::retry::Backoff;

pub struct ConnectionManager {
	client: Arc<dyn BrokerClient>,
	backoff: Backoff,
	clock: Clock,
	attempts: Mutex<Vec<ConnectionAttemptRecord>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
	Connect,
	Reconnect,
}

impl ConnectionManager {
	pub fn new(client: Arc<dyn BrokerClient>, backoff: Backoff, clock: Clock) -> Self {
		Self { client, backoff, clock, attempts: Mutex::new(Vec::new()) }
	}

	pub fn client(&self) -> &Arc<dyn BrokerClient> { &self.client }

	/// Block until the broker accepts the session, retrying transport
	/// failures with backoff. Appends exactly one record on success.
	/// Cancel by dropping the future.
	pub async fn connect(&self) -> Result<ConnectionAttemptRecord> { self.establish(Mode::Connect).await }

	/// Same retry semantics as [`Self::connect`], measured independently.
	pub async fn reconnect(&self) -> Result<ConnectionAttemptRecord> { self.establish(Mode::Reconnect).await }

	async fn establish(&self, mode: Mode) -> Result<ConnectionAttemptRecord> {
		let started = self.clock.now_ms();
		let mut tries = 0u32;
		loop {
			tries += 1;
			let outcome = match mode {
				Mode::Connect => self.client.connect().await,
				Mode::Reconnect => self.client.reconnect().await,
			};
			match outcome {
				Ok(()) => {
					let record = ConnectionAttemptRecord::new(started, self.clock.now_ms(), tries);
					info!(?mode, tries, delay_ms = record.time_diff, "connected to broker");
					self.attempts.lock().push(record.clone());
					return Ok(record);
				}
				Err(e) if !self.backoff.allows(tries) => {
					warn!(?mode, tries, error = %e, "giving up on broker connection");
					return Err(SessionError::RetriesExhausted { attempts: tries, last: e.to_string() });
				}
				Err(e) => {
					let delay = self.backoff.delay(tries);
					warn!(?mode, tries, error = %e, ?delay, "connection error, retrying");
					tokio::time::sleep(delay).await;
				}
			}
		}
	}

	pub fn attempts(&self) -> Vec<ConnectionAttemptRecord> { self.attempts.lock().clone() }
}
