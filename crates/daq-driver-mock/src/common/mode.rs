//! Operational modes for mock devices.
//!
//! - **Instant**: no delays, deterministic behavior for unit tests
//! - **Realistic**: instrument-like step, re-homing and communication delays
//! - **Chaos**: realistic timing, meant to be combined with error injection

use serde::{Deserialize, Serialize};

/// Operational modes for mock devices
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockMode {
    /// Zero delays, deterministic - for unit tests
    #[default]
    Instant,
    /// Hardware-like timing - for integration tests and the CLI
    Realistic,
    /// Hardware-like timing with configurable failures
    Chaos,
}

impl MockMode {
    /// Whether this mode simulates instrument delays.
    pub fn is_timed(&self) -> bool {
        !matches!(self, MockMode::Instant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode() {
        assert_eq!(MockMode::default(), MockMode::Instant);
        assert!(!MockMode::Instant.is_timed());
        assert!(MockMode::Chaos.is_timed());
    }
}
