//! Millisecond timestamps for every observable event.
//!
//! A [`Clock`] is anchored to the wall clock once, at construction, and then
//! advances with the runtime's monotonic instant. Timestamps are therefore
//! comparable across processes (roughly, via NTP) and never go backwards within
//! one session. Under a paused tokio clock they advance with virtual time.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Milliseconds since the Unix epoch, with microsecond resolution.
pub type Millis = f64;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    anchor_ms: Millis,
    origin: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self { anchor_ms: wall_clock_ms(), origin: Instant::now() }
    }

    /// Current timestamp in milliseconds.
    pub fn now_ms(&self) -> Millis {
        let elapsed_us = self.origin.elapsed().as_micros() as f64;
        self.anchor_ms + elapsed_us / 1_000.0
    }
}

/// Raw wall-clock reading, truncated to microseconds.
pub fn wall_clock_ms() -> Millis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as f64 / 1_000.0)
        .unwrap_or(0.0)
}
