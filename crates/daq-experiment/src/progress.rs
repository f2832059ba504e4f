//! Remaining-time estimation.
//!
//! The estimate counts settle periods: every sample costs one `settle_time`,
//! and a source that must re-home between sweeps adds its fixed
//! [`rehoming_time`](daq_core::capabilities::SourceAxis::rehoming_time) once
//! per sweep still to start or finish.

use crate::plan::ScanPlan;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::time::Duration;

/// Snapshot of run progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressEstimate {
    /// Estimated time until the run completes
    #[serde(with = "humantime_serde")]
    pub remaining_time: Duration,
    /// Full sweeps finished so far
    pub completed_repeats: usize,
    /// Points finished in the sweep in progress
    pub points_done: usize,
    /// Estimate for the whole run, used for [`fraction_complete`](Self::fraction_complete)
    #[serde(with = "humantime_serde")]
    pub total_time: Duration,
}

impl ProgressEstimate {
    /// Estimate of a run that has finished or been stopped.
    pub fn finished(total_time: Duration, completed_repeats: usize, points_done: usize) -> Self {
        Self {
            remaining_time: Duration::ZERO,
            completed_repeats,
            points_done,
            total_time,
        }
    }

    /// Wall-clock time the run is expected to end.
    ///
    /// `None` if the remaining time does not fit a calendar date.
    pub fn eta(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let remaining = TimeDelta::from_std(self.remaining_time).ok()?;
        now.checked_add_signed(remaining)
    }

    /// Share of the estimated run time already spent, in `[0, 1]`.
    pub fn fraction_complete(&self) -> f64 {
        if self.total_time.is_zero() {
            return 1.0;
        }
        let done = self.total_time.saturating_sub(self.remaining_time);
        (done.as_secs_f64() / self.total_time.as_secs_f64()).clamp(0.0, 1.0)
    }
}

impl Default for ProgressEstimate {
    fn default() -> Self {
        Self::finished(Duration::ZERO, 0, 0)
    }
}

/// `duration * n`, saturating at `Duration::MAX`.
fn scaled(duration: Duration, n: usize) -> Duration {
    match u32::try_from(n) {
        Ok(n) => duration.saturating_mul(n),
        Err(_) if duration.is_zero() => Duration::ZERO,
        Err(_) => Duration::MAX,
    }
}

/// Estimate the time left in a run.
///
/// # Arguments
/// * `points_done` - points completed in the sweep in progress
/// * `repeats_done` - sweeps completed
/// * `rehoming` - fixed reset cost of the swept source
pub fn estimate(
    plan: &ScanPlan,
    points_done: usize,
    repeats_done: usize,
    rehoming: Duration,
) -> ProgressEstimate {
    let total_time = total_time(plan, rehoming);
    if repeats_done >= plan.repeats {
        return ProgressEstimate::finished(total_time, repeats_done, points_done);
    }

    let per_point = scaled(plan.settle_time, plan.accumulations_per_point);
    let per_repeat = scaled(per_point, plan.point_count());

    let current = scaled(
        per_point,
        plan.point_count().saturating_sub(points_done),
    );
    let future = scaled(per_repeat, plan.repeats - repeats_done - 1);
    let homing = scaled(rehoming, plan.repeats - repeats_done);

    ProgressEstimate {
        remaining_time: current.saturating_add(future).saturating_add(homing),
        completed_repeats: repeats_done,
        points_done,
        total_time,
    }
}

/// Estimated duration of a complete run.
pub fn total_time(plan: &ScanPlan, rehoming: Duration) -> Duration {
    let per_point = scaled(plan.settle_time, plan.accumulations_per_point);
    let per_repeat = scaled(per_point, plan.point_count()).saturating_add(rehoming);
    scaled(per_repeat, plan.repeats)
}
