//! Mock microwave synthesizer (SMBV100A-like) in list mode.
//!
//! ```rust,ignore
//! let source = MockMicrowaveSource::builder()
//!     .mode(MockMode::Realistic)
//!     .build();
//!
//! source.set_sweep(2.8e9, 2e6, 2.95e9, -30.0).await?;
//! source.reset_to_start().await?;
//! source.trigger_next().await?;
//! assert_eq!(source.frequency(), 2.802e9);
//! ```

use anyhow::Result;
use async_trait::async_trait;
use daq_core::capabilities::{AxisKind, SourceAxis};
use daq_core::limits::AxisLimits;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::timing::pause;
use crate::common::{ErrorConfig, MockMode, SweepList, TimingConfig};

const DRIVER: &str = "mock_microwave";

/// Limits of an SMBV100A with the 6 GHz option
pub fn smbv_limits() -> AxisLimits {
    AxisLimits {
        min_value: 9e3,
        max_value: 6e9,
        min_step: 0.1,
        max_step: 6e9 - 9e3,
        max_entries: 10_001,
        min_power: -145.0,
        max_power: 30.0,
    }
}

/// Simulated microwave source.
///
/// Steps electronically through its list, so re-homing costs nothing.
pub struct MockMicrowaveSource {
    output: Mutex<SweepList>,
    limits: AxisLimits,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
    triggers: AtomicU64,
    resets: AtomicU64,
}

impl MockMicrowaveSource {
    /// Instant-mode source with SMBV limits, CW at 2.87 GHz / -30 dBm.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> MockMicrowaveSourceBuilder {
        MockMicrowaveSourceBuilder::default()
    }

    /// Current output frequency (Hz)
    pub fn frequency(&self) -> f64 {
        self.output.lock().value()
    }

    /// Current output power (dBm)
    pub fn power(&self) -> f64 {
        self.output.lock().power()
    }

    /// Position in the sweep list, `None` in CW mode
    pub fn list_index(&self) -> Option<usize> {
        self.output.lock().index()
    }

    /// Number of successful `trigger_next` calls
    pub fn trigger_count(&self) -> u64 {
        self.triggers.load(Ordering::SeqCst)
    }

    /// Number of successful `reset_to_start` calls
    pub fn reset_count(&self) -> u64 {
        self.resets.load(Ordering::SeqCst)
    }

    async fn exchange(&self, operation: &'static str) -> Result<()> {
        self.error_config.check_operation(DRIVER, operation)?;
        pause(self.timing.communication_delay(self.mode)).await;
        if let Some(delay) = self.error_config.stall(operation) {
            pause(delay).await;
        }
        Ok(())
    }
}

impl Default for MockMicrowaveSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceAxis for MockMicrowaveSource {
    fn kind(&self) -> AxisKind {
        AxisKind::Frequency
    }

    fn limits(&self) -> AxisLimits {
        self.limits
    }

    async fn set_cw(&self, value: f64, power: f64) -> Result<(f64, f64)> {
        self.exchange("set_cw").await?;
        let applied = self.output.lock().set_cw(value, power, &self.limits);
        tracing::debug!(frequency = applied.0, power = applied.1, "MockMicrowave: CW on");
        Ok(applied)
    }

    async fn set_sweep(&self, start: f64, step: f64, stop: f64, power: f64) -> Result<(f64, f64, f64)> {
        self.exchange("set_sweep").await?;
        let applied = self
            .output
            .lock()
            .set_sweep(start, step, stop, power, &self.limits)?;
        tracing::debug!(
            start = applied.0,
            step = applied.1,
            stop = applied.2,
            "MockMicrowave: list programmed"
        );
        Ok(applied)
    }

    async fn trigger_next(&self) -> Result<()> {
        self.exchange("trigger").await?;
        pause(self.timing.step_settling(self.mode)).await;
        self.output.lock().trigger()?;
        self.triggers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reset_to_start(&self) -> Result<()> {
        self.exchange("reset").await?;
        self.output.lock().reset()?;
        self.resets.fetch_add(1, Ordering::SeqCst);
        tracing::trace!("MockMicrowave: list position reset");
        Ok(())
    }
}

/// Builder for [`MockMicrowaveSource`]
#[derive(Debug, Clone)]
pub struct MockMicrowaveSourceBuilder {
    limits: AxisLimits,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
}

impl Default for MockMicrowaveSourceBuilder {
    fn default() -> Self {
        Self {
            limits: smbv_limits(),
            mode: MockMode::default(),
            timing: TimingConfig::microwave(),
            error_config: ErrorConfig::default(),
        }
    }
}

impl MockMicrowaveSourceBuilder {
    pub fn limits(mut self, limits: AxisLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    pub fn error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = config;
        self
    }

    pub fn build(self) -> MockMicrowaveSource {
        MockMicrowaveSource {
            output: Mutex::new(SweepList::new(2.87e9, -30.0)),
            limits: self.limits,
            mode: self.mode,
            timing: self.timing,
            error_config: self.error_config,
            triggers: AtomicU64::new(0),
            resets: AtomicU64::new(0),
        }
    }
}
