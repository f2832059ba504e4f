//! Output state shared by the simulated sources.
//!
//! Models the list/sweep mode of a synthesizer or field controller: a
//! programmed `start..=stop` grid walked one step per trigger, wrapping back to
//! the first entry after the last one, plus a fixed CW output.

use anyhow::{bail, Result};
use daq_core::limits::AxisLimits;

/// Programmed output of a steppable source
#[derive(Debug, Clone, PartialEq)]
pub struct SweepList {
    /// Fixed output when no sweep is active
    cw_value: f64,
    power: f64,
    sweep: Option<Sweep>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Sweep {
    start: f64,
    step: f64,
    entries: usize,
    index: usize,
}

impl SweepList {
    pub fn new(cw_value: f64, power: f64) -> Self {
        Self {
            cw_value,
            power,
            sweep: None,
        }
    }

    /// Switch to a fixed output, clamped by `limits`.
    pub fn set_cw(&mut self, value: f64, power: f64, limits: &AxisLimits) -> (f64, f64) {
        self.cw_value = limits.value_in_range(value);
        self.power = limits.power_in_range(power);
        self.sweep = None;
        (self.cw_value, self.power)
    }

    /// Program a sweep list, coercing it onto the instrument grid.
    pub fn set_sweep(
        &mut self,
        start: f64,
        step: f64,
        stop: f64,
        power: f64,
        limits: &AxisLimits,
    ) -> Result<(f64, f64, f64)> {
        if !(start.is_finite() && step.is_finite() && stop.is_finite()) || step == 0.0 {
            bail!("invalid sweep list start={start} step={step} stop={stop}");
        }
        let start = limits.value_in_range(start);
        let step = limits.step_in_range(step);
        let stop = limits.value_in_range(stop).max(start);

        // Tolerate rounding in stop = start + n * step
        let steps = ((stop - start) / step + 1e-9).floor() as usize;
        let entries = steps + 1;
        if entries > limits.max_entries {
            bail!(
                "sweep list of {} entries exceeds instrument maximum {}",
                entries,
                limits.max_entries
            );
        }

        self.power = limits.power_in_range(power);
        self.sweep = Some(Sweep {
            start,
            step,
            entries,
            index: 0,
        });
        Ok((start, step, start + steps as f64 * step))
    }

    /// Advance one entry, wrapping after the last.
    pub fn trigger(&mut self) -> Result<()> {
        let Some(sweep) = self.sweep.as_mut() else {
            bail!("trigger received without an active sweep list");
        };
        sweep.index = (sweep.index + 1) % sweep.entries;
        Ok(())
    }

    /// Go back to the first entry.
    pub fn reset(&mut self) -> Result<()> {
        let Some(sweep) = self.sweep.as_mut() else {
            bail!("reset received without an active sweep list");
        };
        sweep.index = 0;
        Ok(())
    }

    /// Value currently output.
    pub fn value(&self) -> f64 {
        match self.sweep {
            Some(s) => s.start + s.index as f64 * s.step,
            None => self.cw_value,
        }
    }

    pub fn power(&self) -> f64 {
        self.power
    }

    /// Index in the sweep list, `None` in CW mode.
    pub fn index(&self) -> Option<usize> {
        self.sweep.map(|s| s.index)
    }

    /// Distance from the current output back to the sweep start.
    pub fn distance_to_start(&self) -> f64 {
        match self.sweep {
            Some(s) => s.index as f64 * s.step,
            None => 0.0,
        }
    }
}
