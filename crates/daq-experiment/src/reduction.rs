//! Sample reduction: raw cube -> averaged series.
//!
//! Every average is recomputed from the raw [`SampleCube`] rather than kept as
//! a running sum, so a sample that was re-read and overwritten can never leave
//! a stale contribution behind.

use daq_core::data::{AveragedSeries, ChannelSample, SampleCube, CHANNEL_COUNT};
use daq_core::error::{AppResult, DaqError};

/// Per-channel mean of the samples stored at `point`.
///
/// Covers every accumulation of repeats `0..completed_repeats`, plus the first
/// `accumulations_in_progress` accumulations of repeat `completed_repeats`.
/// Cost is `O(accumulations * repeats)`; the engine calls this once per
/// completed point.
pub fn reduce(
    cube: &SampleCube,
    point: usize,
    completed_repeats: usize,
    accumulations_in_progress: usize,
) -> AppResult<ChannelSample> {
    if point >= cube.points() {
        return Err(DaqError::InvalidParameter(format!(
            "point {} outside sweep of {} points",
            point,
            cube.points()
        )));
    }
    if completed_repeats > cube.repeats()
        || accumulations_in_progress > cube.accumulations()
        || (completed_repeats == cube.repeats() && accumulations_in_progress > 0)
    {
        return Err(DaqError::InvalidParameter(format!(
            "reduction range exceeds cube: {} repeats + {} accumulations",
            completed_repeats, accumulations_in_progress
        )));
    }

    let mut sum = [0.0f64; CHANNEL_COUNT];
    let mut count = 0usize;

    let ranges = (0..completed_repeats)
        .map(|r| (r, cube.accumulations()))
        .chain(std::iter::once((completed_repeats, accumulations_in_progress)));
    for (repeat, accumulations) in ranges {
        for accumulation in 0..accumulations {
            if let Some(sample) = cube.sample(repeat, accumulation, point) {
                for (acc, value) in sum.iter_mut().zip(sample) {
                    *acc += value;
                }
                count += 1;
            }
        }
    }

    if count == 0 {
        return Err(DaqError::InvalidParameter(format!(
            "no samples stored at point {} to average",
            point
        )));
    }

    let n = count as f64;
    Ok(sum.map(|s| s / n))
}

/// Spectrum written at the end of a run.
///
/// Averages over completed repeats only, so a sweep interrupted half way does
/// not skew the result. If not even one repeat completed, the partial first
/// repeat is used and unmeasured points read zero.
pub fn completed_repeats_series(
    cube: &SampleCube,
    x: &[f64],
    completed_repeats: usize,
) -> AppResult<AveragedSeries> {
    let repeats = completed_repeats.clamp(1, cube.repeats());
    let mut series = AveragedSeries::new(x.to_vec());
    for point in 0..cube.points().min(x.len()) {
        series.set(point, reduce(cube, point, repeats, 0)?)?;
    }
    Ok(series)
}

/// One spectrum per repeat `0..repeats`, each averaged over accumulations only.
pub fn repeat_series(
    cube: &SampleCube,
    x: &[f64],
    repeats: usize,
) -> AppResult<Vec<AveragedSeries>> {
    (0..repeats.min(cube.repeats()))
        .map(|repeat| {
            let mut series = AveragedSeries::new(x.to_vec());
            for point in 0..cube.points().min(x.len()) {
                let mut sum = [0.0f64; CHANNEL_COUNT];
                for accumulation in 0..cube.accumulations() {
                    if let Some(sample) = cube.sample(repeat, accumulation, point) {
                        for (acc, value) in sum.iter_mut().zip(sample) {
                            *acc += value;
                        }
                    }
                }
                let n = cube.accumulations() as f64;
                series.set(point, sum.map(|s| s / n))?;
            }
            Ok(series)
        })
        .collect()
}
