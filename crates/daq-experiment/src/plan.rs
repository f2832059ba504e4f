//! Sweep plans and their validation.
//!
//! A [`SweepRequest`] is what an operator types in: start, step and stop of the
//! swept quantity plus the fixed companion value and microwave power. It is
//! normalized against the sources' limits into a [`SweepAxis`] whose grid is
//! exact: `stop == start + n * step` for an integer `n >= 0`.
//!
//! ```rust,ignore
//! let request = SweepRequest::Frequency {
//!     start: 2800e6, step: 2e6, stop: 2949e6, fixed_field: 3480.0, power: -10.0,
//! };
//! let axis = request.normalize(&microwave.limits(), &magnet.limits())?;
//! assert_eq!(axis.point_count(), 76); // stop snapped to 2950 MHz
//! ```

use daq_core::capabilities::AxisKind;
use daq_core::data::CHANNEL_COUNT;
use daq_core::error::{AppResult, DaqError};
use daq_core::limits::AxisLimits;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Grid normalization
// =============================================================================

/// Exact sweep grid produced by [`normalize`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SweepGrid {
    pub start: f64,
    /// Always positive
    pub step: f64,
    pub stop: f64,
    /// Number of steps `n`; the grid has `n + 1` points
    pub steps: usize,
}

impl SweepGrid {
    pub fn point_count(&self) -> usize {
        self.steps + 1
    }

    /// Value of every grid point, `start + i * step`.
    pub fn values(&self) -> Vec<f64> {
        (0..self.point_count())
            .map(|i| self.start + i as f64 * self.step)
            .collect()
    }
}

/// Snap `start`/`step`/`stop` onto an exact grid inside `limits`.
///
/// Out-of-range values are clamped by the limits. A `stop` at or below
/// `start` is moved to `start + step`, so every grid has at least one point.
/// The step magnitude is used; sweeps always ascend.
pub fn normalize(start: f64, step: f64, stop: f64, limits: &AxisLimits) -> AppResult<SweepGrid> {
    if !(start.is_finite() && step.is_finite() && stop.is_finite()) {
        return Err(DaqError::InvalidParameter(format!(
            "sweep values must be finite (start={}, step={}, stop={})",
            start, step, stop
        )));
    }
    if step == 0.0 {
        return Err(DaqError::InvalidParameter(
            "sweep step must not be zero".to_string(),
        ));
    }

    let start = limits.value_in_range(start);
    let step = limits.step_in_range(step);
    let mut stop = stop;
    if stop <= start {
        stop = start + step;
    }
    let stop = limits.value_in_range(stop);

    let mut n = ((stop - start) / step).round();
    if n < 0.0 {
        n = 1.0;
    }
    // Rounding up may have pushed the last point past the limit
    while n > 0.0 && start + n * step > limits.max_value {
        n -= 1.0;
    }

    if n + 1.0 > limits.max_entries as f64 {
        return Err(DaqError::InvalidParameter(format!(
            "sweep has {} points, source accepts at most {}",
            n + 1.0,
            limits.max_entries
        )));
    }

    Ok(SweepGrid {
        start,
        step,
        stop: start + n * step,
        steps: n as usize,
    })
}

// =============================================================================
// SweepRequest / SweepAxis
// =============================================================================

/// Unvalidated sweep parameters, as configured by the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SweepRequest {
    /// Step the microwave frequency at a fixed magnetic field
    Frequency {
        start: f64,
        step: f64,
        stop: f64,
        fixed_field: f64,
        power: f64,
    },
    /// Step the magnetic field at a fixed microwave frequency
    Field {
        start: f64,
        step: f64,
        stop: f64,
        fixed_frequency: f64,
        power: f64,
    },
}

impl SweepRequest {
    pub fn kind(&self) -> AxisKind {
        match self {
            Self::Frequency { .. } => AxisKind::Frequency,
            Self::Field { .. } => AxisKind::Field,
        }
    }

    /// Validate against the microwave and magnet limits.
    ///
    /// The swept quantity is checked against its own source. The microwave
    /// power, and the fixed frequency of a field sweep, are clamped by the
    /// microwave limits; the fixed field of a frequency sweep by the magnet
    /// limits.
    pub fn normalize(&self, microwave: &AxisLimits, magnet: &AxisLimits) -> AppResult<SweepAxis> {
        match *self {
            Self::Frequency {
                start,
                step,
                stop,
                fixed_field,
                power,
            } => {
                let grid = normalize(start, step, stop, microwave)?;
                Ok(SweepAxis::FrequencySweep {
                    start: grid.start,
                    step: grid.step,
                    stop: grid.stop,
                    fixed_field: checked_value("fixed field", fixed_field, magnet)?,
                    power: checked_power(power, microwave)?,
                })
            }
            Self::Field {
                start,
                step,
                stop,
                fixed_frequency,
                power,
            } => {
                let grid = normalize(start, step, stop, magnet)?;
                Ok(SweepAxis::FieldSweep {
                    start: grid.start,
                    step: grid.step,
                    stop: grid.stop,
                    fixed_frequency: checked_value("fixed frequency", fixed_frequency, microwave)?,
                    power: checked_power(power, microwave)?,
                })
            }
        }
    }
}

fn checked_value(name: &str, value: f64, limits: &AxisLimits) -> AppResult<f64> {
    if !value.is_finite() {
        return Err(DaqError::InvalidParameter(format!(
            "{} must be finite, got {}",
            name, value
        )));
    }
    Ok(limits.value_in_range(value))
}

fn checked_power(power: f64, limits: &AxisLimits) -> AppResult<f64> {
    if !power.is_finite() {
        return Err(DaqError::InvalidParameter(format!(
            "power must be finite, got {}",
            power
        )));
    }
    Ok(limits.power_in_range(power))
}

/// Validated sweep axis with an exact grid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SweepAxis {
    FrequencySweep {
        start: f64,
        step: f64,
        stop: f64,
        fixed_field: f64,
        power: f64,
    },
    FieldSweep {
        start: f64,
        step: f64,
        stop: f64,
        fixed_frequency: f64,
        power: f64,
    },
}

impl SweepAxis {
    pub fn kind(&self) -> AxisKind {
        match self {
            Self::FrequencySweep { .. } => AxisKind::Frequency,
            Self::FieldSweep { .. } => AxisKind::Field,
        }
    }

    pub fn grid(&self) -> SweepGrid {
        let (start, step, stop) = match *self {
            Self::FrequencySweep {
                start, step, stop, ..
            }
            | Self::FieldSweep {
                start, step, stop, ..
            } => (start, step, stop),
        };
        let steps = ((stop - start) / step).round().max(0.0) as usize;
        SweepGrid {
            start,
            step,
            stop,
            steps,
        }
    }

    pub fn point_count(&self) -> usize {
        self.grid().point_count()
    }

    pub fn values(&self) -> Vec<f64> {
        self.grid().values()
    }

    /// Microwave output power (dBm)
    pub fn power(&self) -> f64 {
        match *self {
            Self::FrequencySweep { power, .. } | Self::FieldSweep { power, .. } => power,
        }
    }

    /// Fixed value of the source that is not swept
    pub fn companion_value(&self) -> f64 {
        match *self {
            Self::FrequencySweep { fixed_field, .. } => fixed_field,
            Self::FieldSweep {
                fixed_frequency, ..
            } => fixed_frequency,
        }
    }

    /// The request that normalizes back to this axis.
    pub fn to_request(&self) -> SweepRequest {
        match *self {
            Self::FrequencySweep {
                start,
                step,
                stop,
                fixed_field,
                power,
            } => SweepRequest::Frequency {
                start,
                step,
                stop,
                fixed_field,
                power,
            },
            Self::FieldSweep {
                start,
                step,
                stop,
                fixed_frequency,
                power,
            } => SweepRequest::Field {
                start,
                step,
                stop,
                fixed_frequency,
                power,
            },
        }
    }
}

// =============================================================================
// ScanPlan
// =============================================================================

/// Everything the acquisition engine needs for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanPlan {
    pub axis: SweepAxis,
    /// Number of full sweeps
    pub repeats: usize,
    /// Samples averaged at each point per sweep
    pub accumulations_per_point: usize,
    /// Lock-in channels per sample
    pub channel_count: usize,
    /// Dead time before each sample
    #[serde(with = "humantime_serde")]
    pub settle_time: Duration,
}

impl ScanPlan {
    pub fn new(
        axis: SweepAxis,
        repeats: usize,
        accumulations_per_point: usize,
        settle_time: Duration,
    ) -> AppResult<Self> {
        let plan = Self {
            axis,
            repeats,
            accumulations_per_point,
            channel_count: CHANNEL_COUNT,
            settle_time,
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Check the counts; the axis grid is checked by the engine against live limits.
    pub fn validate(&self) -> AppResult<()> {
        if self.repeats == 0 {
            return Err(DaqError::InvalidParameter(
                "repeats must be at least 1".to_string(),
            ));
        }
        if self.accumulations_per_point == 0 {
            return Err(DaqError::InvalidParameter(
                "accumulations per point must be at least 1".to_string(),
            ));
        }
        if self.channel_count != CHANNEL_COUNT {
            return Err(DaqError::InvalidParameter(format!(
                "channel count must be {}, got {}",
                CHANNEL_COUNT, self.channel_count
            )));
        }
        Ok(())
    }

    pub fn point_count(&self) -> usize {
        self.axis.point_count()
    }

    /// Raw samples per channel in a complete run.
    pub fn total_samples(&self) -> usize {
        self.repeats * self.accumulations_per_point * self.point_count()
    }
}

/// Settle time from the lock-in time constants: `max(tau) * factor`.
pub fn settle_time_from_time_constants(taus: &[f64], factor: f64) -> AppResult<Duration> {
    if !(factor.is_finite() && factor > 0.0) {
        return Err(DaqError::InvalidParameter(format!(
            "waiting time factor must be positive, got {}",
            factor
        )));
    }
    if taus.iter().any(|t| !(t.is_finite() && *t > 0.0)) {
        return Err(DaqError::InvalidParameter(format!(
            "time constants must be positive, got {:?}",
            taus
        )));
    }
    let tau = taus
        .iter()
        .copied()
        .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |a| a.max(t))))
        .ok_or_else(|| DaqError::InvalidParameter("no time constants reported".to_string()))?;

    Duration::try_from_secs_f64(tau * factor)
        .map_err(|e| DaqError::InvalidParameter(format!("settle time out of range: {}", e)))
}
