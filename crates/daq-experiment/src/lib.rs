//! Swept acquisition for eproc-daq.
//!
//! Provides:
//! - [`plan`]: sweep plan validation against instrument limits
//! - [`reduction`]: averaging of the raw sample cube
//! - [`progress`]: remaining-time estimation
//! - [`engine`]: the acquisition state machine that drives the hardware

pub mod engine;
pub mod plan;
pub mod progress;
pub mod reduction;

pub use engine::{
    AcquisitionEngine, AcquisitionPosition, AcquisitionState, EngineConfig, EngineEvent,
    MeasurementSettings, StopReason,
};
pub use plan::{normalize, ScanPlan, SweepAxis, SweepGrid, SweepRequest};
pub use progress::ProgressEstimate;
