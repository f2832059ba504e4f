//! Timing configuration for realistic mode.
//!
//! Delays of the simulated instruments. Every value is ignored in
//! [`MockMode::Instant`](super::MockMode::Instant).

use super::MockMode;
use std::time::Duration;

/// Instrument delays in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimingConfig {
    /// Time for the output to settle after one sweep step
    pub step_settling_ms: u64,
    /// Time to return from the end of a sweep to its start
    pub rehoming_ms: u64,
    /// Round trip of one command (serial, VISA, HTTP)
    pub communication_delay_ms: u64,
}

impl TimingConfig {
    /// Microwave synthesizer in list mode: electronic stepping, no re-homing
    pub fn microwave() -> Self {
        Self {
            step_settling_ms: 1,
            rehoming_ms: 0,
            communication_delay_ms: 2,
        }
    }

    /// Field controller driving an electromagnet
    pub fn magnet() -> Self {
        Self {
            step_settling_ms: 50,
            rehoming_ms: 1000,
            communication_delay_ms: 5,
        }
    }

    /// Lock-in amplifier read over the network
    pub fn lockin() -> Self {
        Self {
            step_settling_ms: 0,
            rehoming_ms: 0,
            communication_delay_ms: 2,
        }
    }

    fn scaled(&self, ms: u64, mode: MockMode) -> Duration {
        if mode.is_timed() {
            Duration::from_millis(ms)
        } else {
            Duration::ZERO
        }
    }

    pub fn step_settling(&self, mode: MockMode) -> Duration {
        self.scaled(self.step_settling_ms, mode)
    }

    pub fn rehoming(&self, mode: MockMode) -> Duration {
        self.scaled(self.rehoming_ms, mode)
    }

    pub fn communication_delay(&self, mode: MockMode) -> Duration {
        self.scaled(self.communication_delay_ms, mode)
    }
}

/// Sleep unless the duration is zero.
pub(crate) async fn pause(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}
