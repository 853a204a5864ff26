//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. `config/tempchar.toml` (base configuration)
//! 2. Environment variables prefixed with `TEMPCHAR_` (nested keys split on `__`)
//!
//! # Example
//! ```no_run
//! use tempchar::config::EngineConfig;
//!
//! let config = EngineConfig::load()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), tempchar::error::MeasError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::DeviceId;
use crate::error::{MeasError, MeasResult};
use crate::logging::OutputFormat;
use crate::relay::SampleMode;
use crate::report::ReportEncoding;
use crate::settings::{TabConfig, TabSet};
use crate::validation::Validator;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/tempchar.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub debug: DebugOptions,
    /// Instrument slots
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    /// Measurement tabs
    #[serde(default)]
    pub tabs: Vec<TabConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    #[serde(default)]
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "tempchar".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::default(),
        }
    }
}

/// Report output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory the report file is written to
    pub directory: PathBuf,
    #[serde(default)]
    pub encoding: ReportEncoding,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data"),
            encoding: ReportEncoding::default(),
        }
    }
}

/// Temperature and sample plan of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    #[serde(default)]
    pub multi_temperature: bool,
    /// Chamber set points in °C, visited in order
    #[serde(default)]
    pub temperatures: Vec<f64>,
    #[serde(default)]
    pub multi_sample: bool,
    #[serde(default = "default_sample_count")]
    pub sample_count: u8,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            multi_temperature: false,
            temperatures: Vec::new(),
            multi_sample: false,
            sample_count: default_sample_count(),
        }
    }
}

impl RunSettings {
    pub fn sample_mode(&self) -> SampleMode {
        if self.multi_sample {
            SampleMode::Multi {
                count: self.sample_count,
            }
        } else {
            SampleMode::Single
        }
    }
}

/// Run-scoped debug switches, snapshotted at run start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugOptions {
    /// Do not append the settings footer to the report
    #[serde(default)]
    pub suppress_footer: bool,
    /// Additional channels executors should record
    #[serde(default)]
    pub extra_channels: u8,
    /// Treat warnings as fatal
    #[serde(default)]
    pub stop_on_warning: bool,
    /// Override of the chamber soak time
    #[serde(default, with = "humantime_serde")]
    pub thermal_soak: Option<Duration>,
    /// Upper bound of annotation lines in the completion summary
    #[serde(default = "default_max_log_lines")]
    pub max_log_lines: usize,
}

impl Default for DebugOptions {
    fn default() -> Self {
        Self {
            suppress_footer: false,
            extra_channels: 0,
            stop_on_warning: false,
            thermal_soak: None,
            max_log_lines: default_max_log_lines(),
        }
    }
}

/// One instrument slot in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: DeviceId,
    #[serde(default)]
    pub checked: bool,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_sample_count() -> u8 {
    1
}

fn default_max_log_lines() -> usize {
    100
}

impl EngineConfig {
    /// Configured tabs as a [`TabSet`].
    pub fn tab_set(&self) -> TabSet {
        TabSet::new(self.tabs.clone())
    }

    /// Load configuration from the default file and environment variables.
    ///
    /// Example override: `TEMPCHAR_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> MeasResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> MeasResult<Self> {
        let config: EngineConfig = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("TEMPCHAR_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml_str(toml: &str) -> MeasResult<Self> {
        let config: EngineConfig = Figment::new().merge(Toml::string(toml)).extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> MeasResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(MeasError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let mut ids = Vec::new();
        for device in &self.devices {
            if ids.contains(&device.id) {
                return Err(MeasError::Configuration(format!(
                    "Duplicate device entry: {}",
                    device.id
                )));
            }
            ids.push(device.id);
        }

        let mut names = Vec::new();
        for tab in &self.tabs {
            if names.contains(&tab.name.as_str()) {
                return Err(MeasError::Configuration(format!(
                    "Duplicate tab name: {}",
                    tab.name
                )));
            }
            names.push(tab.name.as_str());
        }

        let plan = Validator::new().validate_run_plan(&self.run);
        if !plan.ok {
            return Err(MeasError::Configuration(plan.messages.join("; ")));
        }
        Ok(())
    }
}
