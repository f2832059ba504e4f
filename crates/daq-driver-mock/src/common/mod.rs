//! Common infrastructure for mock devices.
//!
//! - **mode**: Operational modes (Instant, Realistic, Chaos)
//! - **timing**: Instrument-like delays
//! - **errors**: Error injection framework
//! - **rng**: Seeded random number generator
//! - **sweep**: List-mode output state of the simulated sources

pub mod errors;
pub mod mode;
pub mod rng;
pub mod sweep;
pub mod timing;

pub use errors::{ErrorConfig, ErrorScenario};
pub use mode::MockMode;
pub use rng::MockRng;
pub use sweep::SweepList;
pub use timing::TimingConfig;
