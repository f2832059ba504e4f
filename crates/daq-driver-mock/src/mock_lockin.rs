//! Mock dual-demodulator lock-in amplifier.
//!
//! Samples come from a pluggable generator so tests can script exact values:
//!
//! ```rust,ignore
//! let lockin = MockLockIn::builder()
//!     .generator(|index, _rng| [index as f64 + 1.0; 4])
//!     .build();
//! ```

use anyhow::Result;
use async_trait::async_trait;
use daq_core::capabilities::LockIn;
use daq_core::data::{CHANNEL_COUNT, ChannelSample};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::timing::pause;
use crate::common::{ErrorConfig, MockMode, MockRng, TimingConfig};

const DRIVER: &str = "mock_lockin";

/// Selectable time constants (s)
pub const TAU_TABLE: [f64; 21] = [
    0.0002, 0.0005, 0.001, 0.002, 0.005, 0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0,
    20.0, 50.0, 100.0, 200.0, 500.0, 1000.0,
];

/// Power-up time constants of demodulators A and B (s)
pub const DEFAULT_TIME_CONSTANTS: (f64, f64) = (0.1, 0.0005);

/// Produces the sample for the `index`-th read (0-based).
pub type SampleGenerator = Arc<dyn Fn(u64, &MockRng) -> ChannelSample + Send + Sync>;

/// Nearest selectable time constant
pub fn snap_time_constant(tau: f64) -> f64 {
    TAU_TABLE
        .iter()
        .copied()
        .min_by(|a, b| (a - tau).abs().total_cmp(&(b - tau).abs()))
        .unwrap_or(DEFAULT_TIME_CONSTANTS.0)
}

fn uniform_noise(_index: u64, rng: &MockRng) -> ChannelSample {
    let mut sample = [0.0; CHANNEL_COUNT];
    for value in sample.iter_mut() {
        *value = rng.gen_range(-1.0..1.0);
    }
    sample
}

/// Simulated lock-in
pub struct MockLockIn {
    time_constants: Mutex<(f64, f64)>,
    generator: SampleGenerator,
    rng: MockRng,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
    reads: AtomicU64,
}

impl MockLockIn {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> MockLockInBuilder {
        MockLockInBuilder::default()
    }

    /// Number of successful reads
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
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

impl Default for MockLockIn {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockIn for MockLockIn {
    async fn read_sample(&self) -> Result<ChannelSample> {
        self.exchange("read").await?;
        let index = self.reads.fetch_add(1, Ordering::SeqCst);
        Ok((self.generator)(index, &self.rng))
    }

    async fn time_constants(&self) -> Result<Vec<f64>> {
        self.exchange("get_tau").await?;
        let (a, b) = *self.time_constants.lock();
        Ok(vec![a, b])
    }

    async fn set_time_constants(&self, tau_a: f64, tau_b: f64) -> Result<(f64, f64)> {
        self.exchange("set_tau").await?;
        let applied = (snap_time_constant(tau_a), snap_time_constant(tau_b));
        *self.time_constants.lock() = applied;
        tracing::debug!(tau_a = applied.0, tau_b = applied.1, "MockLockIn: time constants set");
        Ok(applied)
    }
}

/// Builder for [`MockLockIn`]
pub struct MockLockInBuilder {
    generator: SampleGenerator,
    seed: Option<u64>,
    time_constants: (f64, f64),
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
}

impl Default for MockLockInBuilder {
    fn default() -> Self {
        Self {
            generator: Arc::new(uniform_noise),
            seed: None,
            time_constants: DEFAULT_TIME_CONSTANTS,
            mode: MockMode::default(),
            timing: TimingConfig::lockin(),
            error_config: ErrorConfig::default(),
        }
    }
}

impl MockLockInBuilder {
    pub fn generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(u64, &MockRng) -> ChannelSample + Send + Sync + 'static,
    {
        self.generator = Arc::new(generator);
        self
    }

    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn time_constants(mut self, tau_a: f64, tau_b: f64) -> Self {
        self.time_constants = (tau_a, tau_b);
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

    pub fn build(self) -> MockLockIn {
        MockLockIn {
            time_constants: Mutex::new(self.time_constants),
            generator: self.generator,
            rng: MockRng::new(self.seed),
            mode: self.mode,
            timing: self.timing,
            error_config: self.error_config,
            reads: AtomicU64::new(0),
        }
    }
}
