//! Error injection framework for mock devices.
//!
//! Each device calls [`ErrorConfig::check_operation`] at the top of every
//! capability call and [`ErrorConfig::stall`] before answering. Failures are
//! reported as [`DriverError`]s so they travel through `anyhow` like real
//! driver errors.

use super::rng::MockRng;
use daq_core::error::{DriverError, DriverErrorKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Error injection configuration for mock devices
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Per-operation failure rate (0.0 to 1.0); `"*"` matches every operation
    failure_rates: Arc<HashMap<&'static str, f64>>,
    scenarios: Arc<Vec<ErrorScenario>>,
    rng: Arc<MockRng>,
    state: Arc<Mutex<ErrorState>>,
}

#[derive(Debug, Clone)]
pub enum ErrorScenario {
    /// Fail every call of `operation` after `count` successful ones
    FailAfterN {
        operation: &'static str,
        count: u32,
    },
    /// Report a timeout on every call of `operation`
    Timeout { operation: &'static str },
    /// Answer `operation` only after `delay`, so the caller's own timeout fires
    Stall {
        operation: &'static str,
        delay: Duration,
    },
    /// First call fails and every later call reports the link as down
    CommunicationLoss,
    /// First call raises a latched hardware fault
    HardwareFault { code: u32 },
}

#[derive(Default, Debug)]
struct ErrorState {
    operation_counts: HashMap<&'static str, u32>,
    communication_lost: bool,
    /// 0 = no fault
    hardware_fault_code: u32,
}

impl ErrorConfig {
    /// No injected errors (default)
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Uniform random failures on every operation
    pub fn random_failures(rate: f64) -> Self {
        Self::random_failures_seeded(rate, None)
    }

    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*", rate);
        Self::build(rates, Vec::new(), seed)
    }

    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    /// Custom failure rates per operation
    pub fn with_rates(rates: HashMap<&'static str, f64>) -> Self {
        Self::build(rates, Vec::new(), None)
    }

    fn build(
        rates: HashMap<&'static str, f64>,
        scenarios: Vec<ErrorScenario>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// Decide whether `operation` fails on this call.
    ///
    /// Latched faults are reported first, then scenarios in order, then the
    /// random failure rate for `operation` (or the `"*"` rate).
    pub fn check_operation(
        &self,
        driver_type: &str,
        operation: &'static str,
    ) -> Result<(), DriverError> {
        let fail = |kind: DriverErrorKind, message: String| {
            Err(DriverError::new(driver_type, kind, message))
        };
        let mut state = self.state.lock();

        if state.communication_lost {
            return fail(DriverErrorKind::Communication, "link down".into());
        }
        if state.hardware_fault_code != 0 {
            return fail(
                DriverErrorKind::Hardware,
                format!("latched fault code {}", state.hardware_fault_code),
            );
        }

        for scenario in self.scenarios.iter() {
            match *scenario {
                ErrorScenario::FailAfterN { operation: op, count } if op == operation => {
                    let calls = state.operation_counts.entry(operation).or_insert(0);
                    *calls += 1;
                    if *calls > count {
                        return fail(
                            DriverErrorKind::Hardware,
                            format!("'{}' rejected after {} successful calls", operation, count),
                        );
                    }
                }
                ErrorScenario::Timeout { operation: op } if op == operation => {
                    return fail(
                        DriverErrorKind::Timeout,
                        format!("'{}' timed out", operation),
                    );
                }
                ErrorScenario::CommunicationLoss => {
                    state.communication_lost = true;
                    return fail(DriverErrorKind::Communication, "link down".into());
                }
                ErrorScenario::HardwareFault { code } => {
                    state.hardware_fault_code = code;
                    return fail(
                        DriverErrorKind::Hardware,
                        format!("latched fault code {}", code),
                    );
                }
                _ => {}
            }
        }

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);
        if self.rng.should_fail(rate) {
            return fail(
                DriverErrorKind::Communication,
                format!("no answer to '{}'", operation),
            );
        }
        Ok(())
    }

    /// Extra delay injected before `operation` answers.
    pub fn stall(&self, operation: &'static str) -> Option<Duration> {
        self.scenarios.iter().find_map(|s| match s {
            ErrorScenario::Stall {
                operation: op,
                delay,
            } if *op == operation => Some(*delay),
            _ => None,
        })
    }

    /// Clear counters and latched faults
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}
