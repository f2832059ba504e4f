//! `daq-core`
//!
//! Core trait definitions and types shared by the eproc-daq crates.
//!
//! The acquisition engine never talks to a device protocol directly. It consumes
//! the narrow capability traits defined here, which the driver layer (or the
//! simulated devices in `daq-driver-mock`) implement.
//!
//! ## Key Types
//!
//! - [`capabilities::SourceAxis`]: a steppable source (microwave frequency or magnetic field)
//! - [`capabilities::LockIn`]: the 4-channel synchronous detector
//! - [`capabilities::PersistenceSink`]: end-of-run storage
//! - [`data::SampleCube`] / [`data::AveragedSeries`]: raw and reduced measurement data
//! - [`error::DaqError`]: the error taxonomy used across the workspace

pub mod capabilities;
pub mod data;
pub mod error;
pub mod limits;

pub use capabilities::{AxisKind, LockIn, PersistenceSink, SourceAxis};
pub use data::{AveragedSeries, ChannelSample, RunRecord, SampleCube, CHANNEL_COUNT};
pub use error::{AppResult, DaqError, DriverError, DriverErrorKind};
pub use limits::AxisLimits;
