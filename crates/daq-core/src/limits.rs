//! Instrument limits and engine-wide constants.
//!
//! This module centralizes:
//! - Per-source parameter limits used by the sweep plan validator
//! - Default timing and retry constants for the acquisition engine

use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Engine Constants
// =============================================================================

/// Default timeout for a single capability call (5 seconds).
///
/// Applies to `set_cw`, `set_sweep`, `trigger_next`, `reset_to_start` and
/// `read_sample`. An expired call is handled like a communication error.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Readings whose magnitude is below this value on any channel are invalid.
///
/// The lock-in reports values this close to zero when it has not produced
/// real data yet.
pub const NOISE_FLOOR: f64 = 1e-7;

/// Pause between re-reads of an invalid lock-in sample (10 ms).
pub const SAMPLE_RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Default bound on re-reads of an invalid sample before the run faults.
pub const DEFAULT_MAX_SAMPLE_RETRIES: u32 = 100;

// =============================================================================
// Axis Limits
// =============================================================================

/// Parameter limits reported by a source.
///
/// Values outside the limits are clamped, not rejected. Units are the
/// source's native units (Hz for frequency, G for field, dBm for power).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisLimits {
    /// Smallest settable value of the swept quantity
    pub min_value: f64,
    /// Largest settable value of the swept quantity
    pub max_value: f64,
    /// Smallest sweep step
    pub min_step: f64,
    /// Largest sweep step
    pub max_step: f64,
    /// Maximum number of points in one sweep list
    pub max_entries: usize,
    /// Smallest output power
    pub min_power: f64,
    /// Largest output power
    pub max_power: f64,
}

impl AxisLimits {
    /// Clamp a value of the swept quantity into range.
    pub fn value_in_range(&self, value: f64) -> f64 {
        value.clamp(self.min_value, self.max_value)
    }

    /// Clamp a sweep step magnitude into range.
    pub fn step_in_range(&self, step: f64) -> f64 {
        step.abs().clamp(self.min_step, self.max_step)
    }

    /// Clamp an output power into range.
    pub fn power_in_range(&self, power: f64) -> f64 {
        power.clamp(self.min_power, self.max_power)
    }
}
