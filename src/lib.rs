//! # EPRoC DAQ
//!
//! Swept electron paramagnetic resonance acquisition: a microwave source or a
//! magnet is stepped across a grid while a lock-in amplifier is sampled at
//! every point, and the readings are averaged over accumulations and repeats.
//!
//! ## Crate Structure
//!
//! The workspace is split the same way the acquisition is:
//!
//! - **`daq-core`**: error taxonomy, capability traits (`SourceAxis`, `LockIn`,
//!   `PersistenceSink`), sample containers and instrument limits.
//! - **`daq-experiment`**: sweep plan validation, sample reduction, progress
//!   estimation and the acquisition state machine.
//! - **`daq-driver-mock`**: simulated microwave source, magnet and lock-in.
//! - **`daq-storage`**: tab-separated text persistence.
//!
//! This crate adds what the `eproc-daq` binary needs on top:
//!
//! - **`config`**: Figment configuration (TOML file + `EPROC_DAQ_` environment).
//! - **`tracing_setup`**: `tracing-subscriber` initialisation.
//! - **`session`**: wires configuration, mock hardware, engine and storage together.

pub mod config;
pub mod session;
pub mod tracing_setup;

pub use daq_core::error::{AppResult, DaqError};
