//! Acquisition session: one configured engine over the simulated hardware.
//!
//! A [`Session`] owns everything a run needs:
//!
//! - the validated [`EprocConfig`] it was built from
//! - mock microwave source, magnet and lock-in in the configured
//!   [`MockMode`](daq_driver_mock::MockMode)
//! - an [`AcquisitionEngine`] preloaded with the configured measurement settings
//! - a [`TsvWriter`] pointed at the configured output directory
//!
//! ```rust,ignore
//! let session = Session::new(EprocConfig::load()?)?;
//! session.start().await?;
//! let reason = session.engine().join().await?;
//! let path = session.save(None).await?;
//! ```

use crate::config::EprocConfig;
use daq_core::error::AppResult;
use daq_driver_mock::{ErrorConfig, MockLockIn, MockMagnet, MockMicrowaveSource, MockMode};
use daq_experiment::{AcquisitionEngine, ProgressEstimate, ScanPlan};
use daq_storage::TsvWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub struct Session {
    config: EprocConfig,
    engine: Arc<AcquisitionEngine>,
    writer: TsvWriter,
}

impl Session {
    /// Validate `config` and build the simulated instrument set.
    pub fn new(config: EprocConfig) -> AppResult<Self> {
        config.validate()?;

        let simulation = config.simulation;
        let errors = |salt: u64| match simulation.mode {
            MockMode::Chaos => ErrorConfig::random_failures_seeded(
                simulation.failure_rate,
                simulation.seed.map(|s| s.wrapping_add(salt)),
            ),
            _ => ErrorConfig::none(),
        };

        let microwave = MockMicrowaveSource::builder()
            .mode(simulation.mode)
            .error_config(errors(1))
            .build();
        let magnet = MockMagnet::builder()
            .mode(simulation.mode)
            .error_config(errors(2))
            .build();
        let mut lockin = MockLockIn::builder()
            .mode(simulation.mode)
            .error_config(errors(3));
        if let Some(seed) = simulation.seed {
            lockin = lockin.rng_seed(seed);
        }

        let engine = AcquisitionEngine::new(
            Arc::new(microwave),
            Arc::new(magnet),
            Arc::new(lockin.build()),
            config.engine.clone(),
        )
        .with_settings(config.measurement_settings());

        info!(
            name = %config.application.name,
            mode = ?simulation.mode,
            output_dir = %config.storage.output_dir.display(),
            "Session ready"
        );

        Ok(Self {
            writer: TsvWriter::new(config.storage.output_dir.clone()),
            engine: Arc::new(engine),
            config,
        })
    }

    /// Save into `dir` instead of the configured output directory.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.writer = TsvWriter::new(dir);
        self
    }

    pub fn config(&self) -> &EprocConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<AcquisitionEngine> {
        &self.engine
    }

    pub fn output_dir(&self) -> &Path {
        self.writer.output_dir()
    }

    /// Program the lock-in and build the plan without starting it.
    pub async fn prepare(&self) -> AppResult<ScanPlan> {
        self.apply_time_constants().await?;
        self.engine.build_plan().await
    }

    /// Program the lock-in and start the configured run on its own task.
    pub async fn start(&self) -> AppResult<ScanPlan> {
        self.apply_time_constants().await?;
        self.engine.start_configured().await
    }

    async fn apply_time_constants(&self) -> AppResult<()> {
        let lockin = &self.config.lockin;
        self.engine
            .set_time_constants(lockin.tau_a, lockin.tau_b)
            .await?;
        Ok(())
    }

    /// Save the last run, tagged `tag` or the configured tag.
    pub async fn save(&self, tag: Option<&str>) -> AppResult<PathBuf> {
        let tag = tag.unwrap_or(&self.config.storage.tag);
        self.engine.save(&self.writer, tag).await
    }
}

/// One-line progress report, e.g. `sweep 2/5, 37% done, 00h01m12s left`.
pub fn describe_progress(estimate: &ProgressEstimate, repeats: usize) -> String {
    let sweep = (estimate.completed_repeats + 1).min(repeats.max(1));
    let secs = estimate.remaining_time.as_secs();
    format!(
        "sweep {}/{}, {:.0}% done, {:02}h{:02}m{:02}s left",
        sweep,
        repeats,
        estimate.fraction_complete() * 100.0,
        secs / 3600,
        (secs / 60) % 60,
        secs % 60
    )
}
