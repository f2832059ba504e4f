//! Mock Hardware Drivers for eproc-daq
//!
//! Simulated instruments for running the acquisition engine without a
//! spectrometer attached. All delays use `tokio::time::sleep`, so tests can
//! run them under paused time.
//!
//! # Available Mock Drivers
//!
//! - [`MockMicrowaveSource`] - SMBV100A-like synthesizer stepping a frequency list
//! - [`MockMagnet`] - Field controller with settling and re-homing ramps
//! - [`MockLockIn`] - Dual-demodulator lock-in with a scriptable sample generator
//!
//! # Performance Characteristics (`MockMode::Realistic`)
//!
//! - MockMicrowaveSource: 1ms per step, no re-homing cost
//! - MockMagnet: 50ms per step, 1s re-homing
//! - MockLockIn: 2ms per read
//!
//! ```rust,ignore
//! use daq_driver_mock::{MockLockIn, MockMagnet, MockMicrowaveSource, MockMode};
//!
//! let microwave = Arc::new(MockMicrowaveSource::builder().mode(MockMode::Realistic).build());
//! let magnet = Arc::new(MockMagnet::new());
//! let lockin = Arc::new(MockLockIn::builder().rng_seed(7).build());
//! let engine = AcquisitionEngine::new(microwave, magnet, lockin, EngineConfig::default());
//! ```

pub mod common;
mod mock_lockin;
mod mock_magnet;
mod mock_microwave;

pub use common::{ErrorConfig, ErrorScenario, MockMode, MockRng, TimingConfig};

pub use mock_lockin::{
    snap_time_constant, MockLockIn, MockLockInBuilder, SampleGenerator, DEFAULT_TIME_CONSTANTS,
    TAU_TABLE,
};
pub use mock_magnet::{magnet_limits, MockMagnet, MockMagnetBuilder, INITIAL_FIELD};
pub use mock_microwave::{smbv_limits, MockMicrowaveSource, MockMicrowaveSourceBuilder};
