//! Periodic forced disconnects.
//!
//! Runs as its own task on a fixed-rate tick. Each tick draws one uniform
//! sample and, when it falls at or below the configured probability, drops
//! the broker link and records the gap. After a disconnect it holds off for
//! the recovery duration; ticks that elapse meanwhile are skipped. Ticks that
//! find the link already down, or a gap not yet closed, do nothing.

use std::sync::Arc;

use mqprobe_core::FaultConfig;
use mqprobe_transport::BrokerClient;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::state::SessionState;

pub struct FaultInjector {
	config: FaultConfig,
	rng: StdRng,
}

impl FaultInjector {
	pub fn new(config: FaultConfig) -> Self { Self { config, rng: StdRng::from_entropy() } }

	pub fn with_seed(config: FaultConfig, seed: u64) -> Self { Self { config, rng: StdRng::seed_from_u64(seed) } }

	/// Start the injector. It stops once `cancel` turns true (or its sender
	/// is dropped); the handle yields the number of disconnects it forced.
	pub fn spawn(self, client: Arc<dyn BrokerClient>, state: Arc<SessionState>, cancel: watch::Receiver<bool>) -> JoinHandle<u32> {
		tokio::spawn(self.run(client, state, cancel))
	}

	async fn run(mut self, client: Arc<dyn BrokerClient>, state: Arc<SessionState>, mut cancel: watch::Receiver<bool>) -> u32 {
		let period = self.config.interval;
		let mut ticker = interval_at(Instant::now() + period, period);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
		let mut forced = 0u32;
		info!(probability = self.config.probability, ?period, recovery = ?self.config.duration, "fault injector started");

		loop {
			tokio::select! {
				biased;
				_ = cancelled(&mut cancel) => break,
				_ = ticker.tick() => {}
			}
			if !state.is_connected() {
				debug!("tick while disconnected, skipping");
				continue;
			}
			let sample: f64 = self.rng.gen();
			if self.config.probability <= 0.0 || sample > self.config.probability {
				continue;
			}

			// The gap is opened before the link drops so the driver, seeing
			// the resulting disconnect, closes this event instead of opening
			// its own. The connected flag stays with the driver: it flips
			// only once the transport reports the link down.
			if !state.open_disconnect(state.now_ms()) {
				debug!("gap still open, skipping");
				continue;
			}
			if let Err(e) = client.disconnect().await {
				warn!(error = %e, "forced disconnect failed");
				state.discard_open_disconnect();
				continue;
			}
			forced += 1;
			info!(forced, last_seq = ?state.last_seq(), "forced disconnect");

			tokio::select! {
				biased;
				_ = cancelled(&mut cancel) => break,
				_ = tokio::time::sleep(self.config.duration) => {}
			}
		}
		info!(forced, "fault injector stopped");
		forced
	}
}

/// Resolves once cancellation is requested or can no longer be requested.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
	while !*rx.borrow_and_update() {
		if rx.changed().await.is_err() {
			return;
		}
	}
}
