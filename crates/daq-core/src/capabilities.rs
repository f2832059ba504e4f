//! Hardware Capabilities
//!
//! Fine-grained capability traits consumed by the acquisition engine. The
//! engine never sees a concrete driver; it is handed trait objects:
//!
//! - A microwave source implements: `SourceAxis` (frequency axis)
//! - A magnet power supply implements: `SourceAxis` (field axis)
//! - A lock-in amplifier implements: `LockIn`
//! - A storage backend implements: `PersistenceSink`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! async fn step_and_read(axis: &dyn SourceAxis, lockin: &dyn LockIn) -> Result<ChannelSample> {
//!     axis.trigger_next().await?;
//!     lockin.read_sample().await
//! }
//! ```

use crate::data::{ChannelSample, RunRecord};
use crate::limits::AxisLimits;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Axis Kind
// =============================================================================

/// Physical quantity stepped by a [`SourceAxis`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisKind {
    /// Microwave frequency in Hz
    Frequency,
    /// Magnetic field in G
    Field,
}

impl AxisKind {
    /// Native unit
    pub fn unit(&self) -> &'static str {
        match self {
            Self::Frequency => "Hz",
            Self::Field => "G",
        }
    }

    /// Column label for exported data
    pub fn label(&self) -> &'static str {
        match self {
            Self::Frequency => "Frequency (Hz)",
            Self::Field => "Field (G)",
        }
    }
}

impl std::fmt::Display for AxisKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Frequency => write!(f, "frequency"),
            Self::Field => write!(f, "field"),
        }
    }
}

// =============================================================================
// Capability Traits
// =============================================================================

/// Capability: Steppable Source
///
/// A source whose output can be programmed with a sweep list and advanced one
/// point at a time (microwave synthesizer in list mode, field controller).
///
/// # Contract
/// - `set_sweep` programs the list; `reset_to_start` moves the output to its first point
/// - `trigger_next` advances the output by one step
/// - `set_cw` sets a fixed output, used when the source is the companion of a sweep
/// - Values may be coerced by the device; the applied values are returned
#[async_trait]
pub trait SourceAxis: Send + Sync {
    /// Quantity this source steps
    fn kind(&self) -> AxisKind;

    /// Parameter limits of the source
    fn limits(&self) -> AxisLimits;

    /// Fixed cost of `reset_to_start` on top of the normal step time.
    ///
    /// Electronically stepped sources return zero; mechanically swept ones
    /// (a magnet ramping back over the full field range) return their
    /// re-homing time.
    fn rehoming_time(&self) -> Duration {
        Duration::ZERO
    }

    /// Set a fixed (continuous wave) output.
    ///
    /// # Returns
    /// The `(value, power)` actually applied.
    async fn set_cw(&self, value: f64, power: f64) -> Result<(f64, f64)>;

    /// Program a sweep list from `start` to `stop` in `step` increments.
    ///
    /// # Returns
    /// The `(start, step, stop)` actually programmed.
    async fn set_sweep(&self, start: f64, step: f64, stop: f64, power: f64)
        -> Result<(f64, f64, f64)>;

    /// Advance the output to the next point of the sweep list.
    async fn trigger_next(&self) -> Result<()>;

    /// Return the output to the first point of the sweep list.
    async fn reset_to_start(&self) -> Result<()>;
}

/// Capability: Synchronous Detection
///
/// A lock-in amplifier producing one [`ChannelSample`] per read.
#[async_trait]
pub trait LockIn: Send + Sync {
    /// Read the current output of every channel.
    async fn read_sample(&self) -> Result<ChannelSample>;

    /// Currently active time constants in seconds (one per demodulator).
    async fn time_constants(&self) -> Result<Vec<f64>>;

    /// Set the time constants of both demodulators.
    ///
    /// # Returns
    /// The time constants actually applied.
    async fn set_time_constants(&self, tau_a: f64, tau_b: f64) -> Result<(f64, f64)>;
}

/// Capability: Run Persistence
///
/// Consumed once, after a run has reached a terminal state.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Persist a run.
    ///
    /// # Arguments
    /// * `tag` - File name stem; implementations pick a default when empty
    /// * `record` - Averaged series, raw cube and parameter snapshot
    ///
    /// # Returns
    /// Path of the primary file written.
    async fn save(&self, tag: &str, record: &RunRecord) -> Result<PathBuf>;
}
