//! Configuration System using Figment
//!
//! Strongly-typed configuration for the `eproc-daq` binary, loaded from:
//! 1. Built-in defaults
//! 2. A TOML file (`config/eproc.toml` by default)
//! 3. Environment variables prefixed with `EPROC_DAQ_`, `__` separating levels
//!
//! Later sources override earlier ones.
//!
//! # Example
//! ```no_run
//! use eproc_daq::config::EprocConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EprocConfig::load()?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok(())
//! # }
//! ```
//!
//! `EPROC_DAQ_SCAN__REPEATS=5` overrides `scan.repeats`.

use crate::tracing_setup::OutputFormat;
use daq_core::error::{AppResult, DaqError};
use daq_driver_mock::MockMode;
use daq_experiment::{EngineConfig, MeasurementSettings, SweepRequest};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/eproc.toml";

/// Prefix of overriding environment variables
pub const ENV_PREFIX: &str = "EPROC_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EprocConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Swept quantity, grid and companion source
    pub sweep: SweepRequest,
    /// Repeats and accumulations
    pub scan: ScanConfig,
    /// Lock-in time constants and settle factor
    pub lockin: LockInConfig,
    /// Engine timing and retry policy
    #[serde(default)]
    pub engine: EngineConfig,
    /// Where runs are saved
    pub storage: StorageConfig,
    /// Simulated hardware
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    pub repeats: usize,
    pub accumulations_per_point: usize,
}

/// Lock-in setup applied before a run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LockInConfig {
    /// Time constant of demodulator A (s)
    pub tau_a: f64,
    /// Time constant of demodulator B (s)
    pub tau_b: f64,
    /// Settle time = largest tau * this factor
    #[serde(default = "default_waiting_time_factor")]
    pub waiting_time_factor: f64,
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Output directory for data files
    pub output_dir: PathBuf,
    /// File name stem; a timestamp when empty
    #[serde(default)]
    pub tag: String,
}

/// Mock hardware settings
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub mode: MockMode,
    /// Seed of the simulated lock-in noise and injected failures
    #[serde(default)]
    pub seed: Option<u64>,
    /// Per-call failure probability of every instrument in `chaos` mode
    #[serde(default)]
    pub failure_rate: f64,
}

fn default_waiting_time_factor() -> f64 {
    1.0
}

impl Default for EprocConfig {
    fn default() -> Self {
        let settings = MeasurementSettings::default();
        Self {
            application: ApplicationConfig {
                name: "EPRoC DAQ".to_string(),
                log_level: "info".to_string(),
                log_format: OutputFormat::default(),
            },
            sweep: settings.sweep,
            scan: ScanConfig {
                repeats: settings.repeats,
                accumulations_per_point: settings.accumulations_per_point,
            },
            lockin: LockInConfig {
                tau_a: 0.1,
                tau_b: 0.0005,
                waiting_time_factor: settings.waiting_time_factor,
            },
            engine: EngineConfig::default(),
            storage: StorageConfig {
                output_dir: PathBuf::from("data"),
                tag: String::new(),
            },
            simulation: SimulationConfig::default(),
        }
    }
}

impl EprocConfig {
    /// Load from the default file and the environment
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file; a missing file leaves the defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::figment(path.as_ref())
            .extract()
            .map_err(|e| DaqError::Configuration(e.to_string()))
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.scan.repeats == 0 {
            return Err(DaqError::Configuration(
                "scan.repeats must be at least 1".to_string(),
            ));
        }
        if self.scan.accumulations_per_point == 0 {
            return Err(DaqError::Configuration(
                "scan.accumulations_per_point must be at least 1".to_string(),
            ));
        }

        for (name, tau) in [("tau_a", self.lockin.tau_a), ("tau_b", self.lockin.tau_b)] {
            if !(tau.is_finite() && tau > 0.0) {
                return Err(DaqError::Configuration(format!(
                    "lockin.{} must be positive, got {}",
                    name, tau
                )));
            }
        }
        let factor = self.lockin.waiting_time_factor;
        if !(factor.is_finite() && factor > 0.0) {
            return Err(DaqError::Configuration(format!(
                "lockin.waiting_time_factor must be positive, got {}",
                factor
            )));
        }

        let rate = self.simulation.failure_rate;
        if !(0.0..=1.0).contains(&rate) {
            return Err(DaqError::Configuration(format!(
                "simulation.failure_rate must be within [0, 1], got {}",
                rate
            )));
        }

        if self.engine.call_timeout.is_zero() {
            return Err(DaqError::Configuration(
                "engine.call_timeout must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Engine settings described by this configuration
    pub fn measurement_settings(&self) -> MeasurementSettings {
        MeasurementSettings {
            sweep: self.sweep.clone(),
            repeats: self.scan.repeats,
            accumulations_per_point: self.scan.accumulations_per_point,
            waiting_time_factor: self.lockin.waiting_time_factor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = EprocConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.measurement_settings(), MeasurementSettings::default());
    }

    #[test]
    fn test_load_field_sweep() {
        let file = write_config(
            r#"
[application]
name = "Test"
log_level = "debug"
log_format = "json"

[sweep]
mode = "field"
start = 3400.0
step = 0.5
stop = 3500.0
fixed_frequency = 9.4e9
power = -20.0

[scan]
repeats = 3
accumulations_per_point = 4

[lockin]
tau_a = 0.01
tau_b = 0.002
waiting_time_factor = 5.0

[engine]
call_timeout = "2s"
retry_backoff = "50ms"

[storage]
output_dir = "/tmp/eproc"
tag = "sample_7"

[simulation]
mode = "realistic"
seed = 42
"#,
        );

        let config = EprocConfig::load_from(file.path()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.application.log_format, OutputFormat::Json);
        assert!(matches!(config.sweep, SweepRequest::Field { step, .. } if step == 0.5));
        assert_eq!(config.scan.repeats, 3);
        assert_eq!(config.engine.call_timeout, std::time::Duration::from_secs(2));
        assert_eq!(config.engine.max_sample_retries, 100);
        assert_eq!(config.simulation.mode, MockMode::Realistic);
        assert_eq!(config.simulation.seed, Some(42));
        assert_eq!(config.storage.tag, "sample_7");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = EprocConfig::load_from("/nonexistent/eproc.toml").unwrap();
        assert_eq!(config.scan, EprocConfig::default().scan);
    }

    #[test]
    fn test_malformed_file_is_configuration_error() {
        let file = write_config("[scan]\nrepeats = \"many\"\n");
        let err = EprocConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = EprocConfig::default();
        config.application.log_level = "invalid".to_string();
        assert!(matches!(config.validate(), Err(DaqError::Configuration(_))));
    }

    #[test]
    fn test_invalid_scan_and_lockin() {
        let mut config = EprocConfig::default();
        config.scan.repeats = 0;
        assert!(config.validate().is_err());

        let mut config = EprocConfig::default();
        config.lockin.tau_b = 0.0;
        assert!(config.validate().is_err());

        let mut config = EprocConfig::default();
        config.lockin.waiting_time_factor = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = EprocConfig::default();
        config.simulation.failure_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "eproc.toml",
                "[scan]\nrepeats = 2\naccumulations_per_point = 10\n",
            )?;
            jail.set_env("EPROC_DAQ_SCAN__REPEATS", "7");
            jail.set_env("EPROC_DAQ_APPLICATION__LOG_LEVEL", "warn");

            let config = EprocConfig::load_from("eproc.toml")
                .map_err(|e| figment::Error::from(e.to_string()))?;
            assert_eq!(config.scan.repeats, 7);
            assert_eq!(config.scan.accumulations_per_point, 10);
            assert_eq!(config.application.log_level, "warn");
            Ok(())
        });
    }
}
