//! Measurement data containers.
//!
//! - [`SampleCube`]: every raw lock-in reading of a run, indexed
//!   `[repeat][accumulation][point][channel]`
//! - [`AveragedSeries`]: one averaged channel vector per sweep point
//! - [`RunRecord`]: what a [`PersistenceSink`](crate::capabilities::PersistenceSink)
//!   receives at the end of a run

use crate::capabilities::AxisKind;
use crate::error::{AppResult, DaqError};
use serde::Serialize;

/// Number of lock-in channels read per sample.
pub const CHANNEL_COUNT: usize = 4;

/// One lock-in reading, one value per channel.
pub type ChannelSample = [f64; CHANNEL_COUNT];

// =============================================================================
// SampleCube
// =============================================================================

/// Preallocated store of raw readings for one run.
///
/// Allocated once when a run starts and never resized. Unwritten cells hold
/// zero.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleCube {
    repeats: usize,
    accumulations: usize,
    points: usize,
    data: Vec<f64>,
}

impl SampleCube {
    /// Allocate a zeroed cube, rejecting empty or overflowing dimensions.
    pub fn try_new(repeats: usize, accumulations: usize, points: usize) -> AppResult<Self> {
        if repeats == 0 || accumulations == 0 || points == 0 {
            return Err(DaqError::InvalidParameter(format!(
                "sample cube dimensions must be non-zero (repeats={}, accumulations={}, points={})",
                repeats, accumulations, points
            )));
        }

        let len = repeats
            .checked_mul(accumulations)
            .and_then(|n| n.checked_mul(points))
            .and_then(|n| n.checked_mul(CHANNEL_COUNT))
            .ok_or_else(|| DaqError::InvalidParameter("sample cube size overflows".to_string()))?;

        Ok(Self {
            repeats,
            accumulations,
            points,
            data: vec![0.0; len],
        })
    }

    pub fn repeats(&self) -> usize {
        self.repeats
    }

    pub fn accumulations(&self) -> usize {
        self.accumulations
    }

    pub fn points(&self) -> usize {
        self.points
    }

    /// Total number of stored values (all channels).
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Flat view in `[repeat][accumulation][point][channel]` order.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    fn offset(&self, repeat: usize, accumulation: usize, point: usize) -> Option<usize> {
        if repeat >= self.repeats || accumulation >= self.accumulations || point >= self.points {
            return None;
        }
        Some(((repeat * self.accumulations + accumulation) * self.points + point) * CHANNEL_COUNT)
    }

    /// Write one sample, overwriting whatever was stored at that cell.
    pub fn store(
        &mut self,
        repeat: usize,
        accumulation: usize,
        point: usize,
        sample: &ChannelSample,
    ) -> AppResult<()> {
        let offset = self.offset(repeat, accumulation, point).ok_or_else(|| {
            DaqError::InvalidParameter(format!(
                "cube index out of range: repeat={}, accumulation={}, point={}",
                repeat, accumulation, point
            ))
        })?;
        self.data[offset..offset + CHANNEL_COUNT].copy_from_slice(sample);
        Ok(())
    }

    /// Read back one sample.
    pub fn sample(&self, repeat: usize, accumulation: usize, point: usize) -> Option<ChannelSample> {
        let offset = self.offset(repeat, accumulation, point)?;
        let mut out = [0.0; CHANNEL_COUNT];
        out.copy_from_slice(&self.data[offset..offset + CHANNEL_COUNT]);
        Some(out)
    }
}

// =============================================================================
// AveragedSeries
// =============================================================================

/// Averaged spectrum: the sweep axis values and one channel vector per point.
///
/// The length always equals the plan's point count. Points not reduced yet
/// hold zero on every channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AveragedSeries {
    x: Vec<f64>,
    values: Vec<ChannelSample>,
}

impl AveragedSeries {
    /// Zeroed series over the given axis values.
    pub fn new(x: Vec<f64>) -> Self {
        let values = vec![[0.0; CHANNEL_COUNT]; x.len()];
        Self { x, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Sweep axis values (Hz or G).
    pub fn x(&self) -> &[f64] {
        &self.x
    }

    pub fn values(&self) -> &[ChannelSample] {
        &self.values
    }

    pub fn get(&self, point: usize) -> Option<&ChannelSample> {
        self.values.get(point)
    }

    /// Replace the averaged value of one point.
    pub fn set(&mut self, point: usize, value: ChannelSample) -> AppResult<()> {
        let slot = self.values.get_mut(point).ok_or_else(|| {
            DaqError::InvalidParameter(format!(
                "point {} outside series of length {}",
                point,
                self.x.len()
            ))
        })?;
        *slot = value;
        Ok(())
    }

    /// All points of a single channel.
    pub fn channel(&self, channel: usize) -> Vec<f64> {
        self.values
            .iter()
            .map(|v| v.get(channel).copied().unwrap_or(0.0))
            .collect()
    }
}

// =============================================================================
// RunRecord
// =============================================================================

/// Everything persisted at the end of a run.
#[derive(Debug, Clone)]
pub struct RunRecord {
    /// Unique identifier of the run
    pub run_uid: String,
    /// Which quantity was swept
    pub axis: AxisKind,
    /// Spectrum averaged over completed repeats
    pub series: AveragedSeries,
    /// One spectrum per repeat, averaged over accumulations only
    pub repeat_series: Vec<AveragedSeries>,
    /// Raw readings
    pub raw: SampleCube,
    /// Ordered, human-readable parameter snapshot
    pub parameters: Vec<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cube_size() {
        let cube = SampleCube::try_new(2, 10, 76).unwrap();
        assert_eq!(cube.len(), 2 * 10 * 76 * CHANNEL_COUNT);
        assert!(cube.as_slice().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_cube_rejects_empty_dimension() {
        assert!(SampleCube::try_new(0, 1, 1).is_err());
        assert!(SampleCube::try_new(1, 0, 1).is_err());
        assert!(SampleCube::try_new(1, 1, 0).is_err());
    }

    #[test]
    fn test_cube_rejects_overflow() {
        assert!(SampleCube::try_new(usize::MAX, 2, 2).is_err());
    }

    #[test]
    fn test_cube_store_and_read_back() {
        let mut cube = SampleCube::try_new(2, 3, 4).unwrap();
        cube.store(1, 2, 3, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(cube.sample(1, 2, 3), Some([1.0, 2.0, 3.0, 4.0]));
        assert_eq!(cube.sample(0, 0, 0), Some([0.0; CHANNEL_COUNT]));
        // Last cell of the flat buffer
        assert_eq!(&cube.as_slice()[cube.len() - 4..], &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_cube_out_of_range() {
        let mut cube = SampleCube::try_new(1, 1, 1).unwrap();
        assert!(cube.store(1, 0, 0, &[1.0; CHANNEL_COUNT]).is_err());
        assert!(cube.sample(0, 0, 1).is_none());
    }

    #[test]
    fn test_series_starts_zeroed() {
        let series = AveragedSeries::new(vec![1.0, 2.0, 3.0]);
        assert_eq!(series.len(), 3);
        assert!(series.values().iter().all(|v| *v == [0.0; CHANNEL_COUNT]));
    }

    #[test]
    fn test_series_set_and_channel() {
        let mut series = AveragedSeries::new(vec![1.0, 2.0]);
        series.set(1, [0.5, 1.5, 2.5, 3.5]).unwrap();
        assert_eq!(series.channel(2), vec![0.0, 2.5]);
        assert!(series.set(2, [0.0; CHANNEL_COUNT]).is_err());
    }
}
