//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, shared by every crate in
//! the workspace. Using the `thiserror` crate, it provides a centralized way to
//! classify what can go wrong during a swept acquisition, from rejected sweep
//! parameters to instruments that stop answering.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidParameter`**: a sweep plan failed grid or limit validation. Reported
//!   synchronously, never changes engine state.
//! - **`EngineBusy`**: a mutation was attempted while a run owns the hardware.
//!   Reported synchronously, never changes engine state.
//! - **`SampleInvalid`**: the lock-in kept returning readings below the noise floor
//!   past the retry bound. Fatal for the run.
//! - **`HardwareComm`**: a capability call failed or timed out. Fatal for the run.
//! - **`Configuration`**, **`Storage`**: ambient errors from config loading
//!   and persistence.
//!
//! A user cancelling a run is not an error; it is reported as a stop reason on
//! the terminal `Stopped` state.

use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Classification of errors raised by device drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    Initialization,
    Configuration,
    Communication,
    Hardware,
    Timeout,
    InvalidParameter,
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Error raised by a driver, tagged with the driver type that produced it.
#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    pub driver_type: String,
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for eproc-daq.
///
/// # Error Categories
///
/// 1. **Caller errors** - `InvalidParameter`, `EngineBusy`, `Configuration`
///    - Detected before any hardware is touched
///    - Recovery: fix the request and retry
///
/// 2. **Run-fatal errors** - `SampleInvalid`, `HardwareComm`
///    - Terminate the current run; the engine moves to `Faulted`
///    - Data collected up to the last completed point is kept
///
/// 3. **Persistence errors** - `Storage`
///    - Raised after a run while saving; the run data stays in memory
///
/// # Example
///
/// ```rust
/// use daq_core::error::DaqError;
///
/// fn validate_repeats(repeats: usize) -> Result<(), DaqError> {
///     if repeats == 0 {
///         return Err(DaqError::InvalidParameter("repeats must be at least 1".into()));
///     }
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum DaqError {
    /// Sweep plan failed grid or limit validation.
    ///
    /// **Error Type**: Permanent - the same request fails again.
    ///
    /// **Recovery Strategy**: Report to the operator, correct the sweep parameters.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A mutation was attempted while the engine owns the hardware.
    ///
    /// **Error Type**: Transient - succeeds once the run reaches a terminal state.
    ///
    /// **Recovery Strategy**: Stop the run or wait for it to finish.
    #[error("Engine busy: cannot {0} while a run is active")]
    EngineBusy(String),

    /// The lock-in returned readings below the noise floor more often than allowed.
    ///
    /// **Error Type**: Run-fatal.
    #[error("Invalid lock-in sample at point {point}: still below noise floor after {attempts} attempts")]
    SampleInvalid {
        /// Sweep point index being measured
        point: usize,
        /// Number of reads performed, including the first
        attempts: u32,
    },

    /// A capability call failed or exceeded its timeout.
    ///
    /// **Error Type**: Run-fatal.
    ///
    /// **Recovery Strategy**: Check instrument connections, then start a new run.
    #[error("Hardware communication error: {0}")]
    HardwareComm(String),

    /// Configuration values parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Persisting a run failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::EngineBusy("start".to_string());
        assert_eq!(
            err.to_string(),
            "Engine busy: cannot start while a run is active"
        );
    }

    #[test]
    fn test_sample_invalid_display() {
        let err = DaqError::SampleInvalid {
            point: 5,
            attempts: 11,
        };
        let msg = err.to_string();
        assert!(msg.contains("point 5"));
        assert!(msg.contains("11 attempts"));
    }

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::new("mock_lockin", DriverErrorKind::Timeout, "no answer");
        assert_eq!(
            err.to_string(),
            "Driver 'mock_lockin' timeout error: no answer"
        );
    }
}
