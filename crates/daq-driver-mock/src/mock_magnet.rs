//! Mock field controller driving an electromagnet.
//!
//! The field is ramped, so each step has to settle and returning to the
//! start of a sweep costs a full re-homing ramp.

use anyhow::Result;
use async_trait::async_trait;
use daq_core::capabilities::{AxisKind, SourceAxis};
use daq_core::limits::AxisLimits;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::common::timing::pause;
use crate::common::{ErrorConfig, MockMode, SweepList, TimingConfig};

const DRIVER: &str = "mock_magnet";

/// Field the controller powers up with (G)
pub const INITIAL_FIELD: f64 = 3480.0;

pub fn magnet_limits() -> AxisLimits {
    AxisLimits {
        min_value: 0.0,
        max_value: 20_000.0,
        min_step: 0.001,
        max_step: 20_000.0,
        max_entries: 100_001,
        // Power does not apply to a magnet
        min_power: f64::MIN,
        max_power: f64::MAX,
    }
}

/// Simulated magnet supply
pub struct MockMagnet {
    output: Mutex<SweepList>,
    limits: AxisLimits,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
    triggers: AtomicU64,
    resets: AtomicU64,
}

impl MockMagnet {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> MockMagnetBuilder {
        MockMagnetBuilder::default()
    }

    /// Current field (G)
    pub fn field(&self) -> f64 {
        self.output.lock().value()
    }

    pub fn list_index(&self) -> Option<usize> {
        self.output.lock().index()
    }

    pub fn trigger_count(&self) -> u64 {
        self.triggers.load(Ordering::SeqCst)
    }

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

impl Default for MockMagnet {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceAxis for MockMagnet {
    fn kind(&self) -> AxisKind {
        AxisKind::Field
    }

    fn limits(&self) -> AxisLimits {
        self.limits
    }

    fn rehoming_time(&self) -> Duration {
        self.timing.rehoming(self.mode)
    }

    async fn set_cw(&self, value: f64, power: f64) -> Result<(f64, f64)> {
        self.exchange("set_cw").await?;
        let applied = self.output.lock().set_cw(value, power, &self.limits);
        pause(self.timing.step_settling(self.mode)).await;
        tracing::debug!(field = applied.0, "MockMagnet: field set");
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
            "MockMagnet: field sweep programmed"
        );
        Ok(applied)
    }

    async fn trigger_next(&self) -> Result<()> {
        self.exchange("trigger").await?;
        self.output.lock().trigger()?;
        pause(self.timing.step_settling(self.mode)).await;
        self.triggers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reset_to_start(&self) -> Result<()> {
        self.exchange("reset").await?;
        let distance = {
            let mut output = self.output.lock();
            let distance = output.distance_to_start();
            output.reset()?;
            distance
        };
        pause(self.rehoming_time()).await;
        self.resets.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(distance, "MockMagnet: ramped back to sweep start");
        Ok(())
    }
}

/// Builder for [`MockMagnet`]
#[derive(Debug, Clone)]
pub struct MockMagnetBuilder {
    limits: AxisLimits,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
    initial_field: f64,
}

impl Default for MockMagnetBuilder {
    fn default() -> Self {
        Self {
            limits: magnet_limits(),
            mode: MockMode::default(),
            timing: TimingConfig::magnet(),
            error_config: ErrorConfig::default(),
            initial_field: INITIAL_FIELD,
        }
    }
}

impl MockMagnetBuilder {
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

    pub fn initial_field(mut self, field: f64) -> Self {
        self.initial_field = field;
        self
    }

    pub fn build(self) -> MockMagnet {
        MockMagnet {
            output: Mutex::new(SweepList::new(self.initial_field, 0.0)),
            limits: self.limits,
            mode: self.mode,
            timing: self.timing,
            error_config: self.error_config,
            triggers: AtomicU64::new(0),
            resets: AtomicU64::new(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rehoming_only_when_timed() {
        assert_eq!(MockMagnet::new().rehoming_time(), Duration::ZERO);
        let magnet = MockMagnet::builder().mode(MockMode::Realistic).build();
        assert_eq!(magnet.rehoming_time(), Duration::from_secs(1));
        assert_eq!(magnet.kind(), AxisKind::Field);
    }

    #[tokio::test]
    async fn test_field_sweep() {
        let magnet = MockMagnet::new();
        assert_eq!(magnet.field(), INITIAL_FIELD);

        magnet.set_sweep(3000.0, 10.0, 3050.0, 0.0).await.unwrap();
        magnet.reset_to_start().await.unwrap();
        for _ in 0..3 {
            magnet.trigger_next().await.unwrap();
        }
        assert_eq!(magnet.field(), 3030.0);

        magnet.reset_to_start().await.unwrap();
        assert_eq!(magnet.field(), 3000.0);
        assert_eq!(magnet.reset_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_realistic_reset_waits_for_ramp() {
        let magnet = MockMagnet::builder().mode(MockMode::Realistic).build();
        magnet.set_sweep(0.0, 1.0, 10.0, 0.0).await.unwrap();

        let before = tokio::time::Instant::now();
        magnet.reset_to_start().await.unwrap();
        assert!(before.elapsed() >= Duration::from_secs(1));
    }
}
