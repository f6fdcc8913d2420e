//! Session clock in 1/10 ms ticks.

use std::time::Instant;

/// Ticks per millisecond of the 10 kHz AppleMIDI clock.
pub const TICKS_PER_MS: i64 = 10;

/// Monotonic session clock plus the latest round-trip and offset estimates
/// from the CK exchange.
#[derive(Debug)]
pub struct SessionClock {
    start: Instant,
    rtt: i64,
    offset: i64,
    frozen: Option<u64>,
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            rtt: 0,
            offset: 0,
            frozen: None,
        }
    }

    /// Ticks since session start.
    pub fn now_ticks(&self) -> u64 {
        if let Some(ticks) = self.frozen {
            return ticks;
        }
        (self.start.elapsed().as_micros() / 100) as u64
    }

    /// Rewinds the session origin and clears the estimates.
    pub fn restart(&mut self) {
        self.start = Instant::now();
        self.rtt = 0;
        self.offset = 0;
    }

    pub fn record_estimate(&mut self, rtt: i64, offset: i64) {
        self.rtt = rtt;
        self.offset = offset;
    }

    /// Latest round-trip estimate in ticks.
    pub fn rtt_ticks(&self) -> i64 {
        self.rtt
    }

    /// Latest remote-minus-local clock offset estimate in ticks.
    pub fn offset_ticks(&self) -> i64 {
        self.offset
    }

    /// Latest round-trip estimate in milliseconds.
    pub fn rtt_ms(&self) -> f64 {
        self.rtt as f64 / TICKS_PER_MS as f64
    }

    /// Pins `now_ticks` for deterministic tests.
    #[cfg(test)]
    pub(crate) fn freeze(&mut self, ticks: u64) {
        self.frozen = Some(ticks);
    }
}
