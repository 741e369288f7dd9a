//! Configuration using Figment
//!
//! This module provides strongly-typed configuration for the driver.
//! [`SessionConfig`] holds the instrument settings applied by
//! [`crate::session::Session::initialize`]; [`AppConfig`] wraps it together with
//! connection and logging settings for the binary.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/smu2450.toml` by default)
//! 2. Environment variables prefixed with `SMU2450_`, nested with `__`
//!    (e.g. `SMU2450_SESSION__NPLC=2`)
//!
//! # Example
//! ```no_run
//! use smu2450::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Instrument: {}", config.instrument.address);
//! # Ok::<(), smu2450::error::SmuError>(())
//! ```

use crate::buffer::{is_system_buffer, MAX_BUFFER_CAPACITY};
use crate::error::{SmuError, SmuResult};
use crate::logging::OutputFormat;
use crate::validation::{is_in_range, is_positive, is_tsp_identifier, is_valid_address};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default config file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/smu2450.toml";

/// Autozero policy for the measurement reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoZero {
    /// Continuous reference measurements.
    Periodic,
    /// A single reference measurement, then fixed compensation.
    #[default]
    Once,
    /// No reference measurements.
    Off,
}

/// Which set of input/output terminals is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Terminals {
    #[default]
    Front,
    Rear,
}

/// A buffer created on the instrument during `initialize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBuffer {
    /// Buffer name; must be a valid identifier on the instrument
    pub name: String,
    /// Number of readings the buffer holds
    #[serde(default = "default_buffer_capacity")]
    pub capacity: u64,
}

impl UserBuffer {
    pub fn new(name: impl Into<String>, capacity: u64) -> Self {
        Self {
            name: name.into(),
            capacity,
        }
    }
}

/// Instrument settings stored by the session and re-applied before every operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Source voltage range (V)
    pub source_voltage_range: f64,
    /// Source current range (A)
    pub source_current_range: f64,
    /// Measure voltage range (V)
    pub measure_voltage_range: f64,
    /// Measure current range (A)
    pub measure_current_range: f64,
    /// Measure resistance range (Ω); `None` selects autorange
    #[serde(default)]
    pub measure_resistance_range: Option<f64>,
    /// Current limit applied while sourcing voltage (A)
    pub current_limit: f64,
    /// Voltage limit applied while sourcing current (V)
    pub voltage_limit: f64,
    /// Integration time in power-line cycles; `None` keeps the baseline of 1
    #[serde(default)]
    pub nplc: Option<f64>,
    /// Front or rear terminals
    #[serde(default)]
    pub terminals: Terminals,
    /// Four-wire (remote) sensing instead of two-wire
    #[serde(default = "default_true")]
    pub four_wire: bool,
    /// Autozero policy
    #[serde(default)]
    pub autozero: AutoZero,
    /// Record the measured source value instead of the programmed one
    #[serde(default = "default_true")]
    pub source_readback: bool,
    /// Touch the active buffer on the instrument at the end of `initialize`
    #[serde(default = "default_true")]
    pub activate_default_buffer: bool,
    /// Buffer to create and activate during `initialize`
    #[serde(default)]
    pub user_buffer: Option<UserBuffer>,
    /// Significant digits used when dumping buffers
    #[serde(default = "default_ascii_precision")]
    pub ascii_precision: u8,
}

/// NPLC applied when none is configured.
pub const BASELINE_NPLC: f64 = 1.0;

fn default_true() -> bool {
    true
}

fn default_buffer_capacity() -> u64 {
    10_000
}

fn default_ascii_precision() -> u8 {
    10
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            source_voltage_range: 20.0,
            source_current_range: 0.1,
            measure_voltage_range: 20.0,
            measure_current_range: 0.1,
            measure_resistance_range: None,
            current_limit: 0.1,
            voltage_limit: 20.0,
            nplc: None,
            terminals: Terminals::Front,
            four_wire: true,
            autozero: AutoZero::Once,
            source_readback: true,
            activate_default_buffer: true,
            user_buffer: None,
            ascii_precision: default_ascii_precision(),
        }
    }
}

impl SessionConfig {
    /// NPLC actually sent to the instrument.
    pub fn effective_nplc(&self) -> f64 {
        self.nplc.unwrap_or(BASELINE_NPLC)
    }

    /// Check every field before anything is sent to the instrument.
    pub fn validate(&self) -> SmuResult<()> {
        let positive = [
            ("source_voltage_range", self.source_voltage_range),
            ("source_current_range", self.source_current_range),
            ("measure_voltage_range", self.measure_voltage_range),
            ("measure_current_range", self.measure_current_range),
            ("current_limit", self.current_limit),
            ("voltage_limit", self.voltage_limit),
        ];
        for (field, value) in positive {
            is_positive(value).map_err(|reason| field_error(field, value, reason))?;
        }
        if let Some(range) = self.measure_resistance_range {
            is_positive(range)
                .map_err(|reason| field_error("measure_resistance_range", range, reason))?;
        }
        if let Some(nplc) = self.nplc {
            is_in_range(nplc, 0.01..=10.0)
                .map_err(|_| field_error("nplc", nplc, "must be between 0.01 and 10"))?;
        }
        is_in_range(self.ascii_precision, 1..=16).map_err(|_| {
            SmuError::configuration(format!(
                "ascii_precision {} must be between 1 and 16",
                self.ascii_precision
            ))
        })?;

        if let Some(buffer) = &self.user_buffer {
            is_tsp_identifier(&buffer.name).map_err(|reason| {
                SmuError::configuration(format!("user buffer name '{}': {}", buffer.name, reason))
            })?;
            if is_system_buffer(&buffer.name) {
                return Err(SmuError::configuration(format!(
                    "user buffer name '{}' is reserved for a system buffer",
                    buffer.name
                )));
            }
            if !(1..=MAX_BUFFER_CAPACITY).contains(&buffer.capacity) {
                return Err(SmuError::InvalidBufferCapacity {
                    name: buffer.name.clone(),
                    capacity: buffer.capacity,
                    max: MAX_BUFFER_CAPACITY,
                });
            }
        }
        Ok(())
    }
}

fn field_error(field: &str, value: f64, reason: &str) -> SmuError {
    SmuError::configuration(format!("{field} = {value}: {reason}"))
}

/// Where the instrument lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// VISA resource address
    pub address: String,
    /// Use the in-memory transport instead of real hardware
    #[serde(default)]
    pub simulate: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: OutputFormat,
    /// Log the time spent in each session operation
    #[serde(default)]
    pub span_timing: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: OutputFormat::default(),
            span_timing: false,
        }
    }
}

/// Top-level configuration for the binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Connection settings
    pub instrument: InstrumentConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Instrument session settings
    pub session: SessionConfig,
}

impl AppConfig {
    /// Load configuration from the default file and environment variables
    ///
    /// Environment variables override the file with prefix `SMU2450_`.
    /// Example: `SMU2450_LOGGING__LEVEL=debug`
    pub fn load() -> SmuResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> SmuResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SMU2450_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> SmuResult<()> {
        crate::logging::parse_log_level(&self.logging.level)?;
        is_valid_address(&self.instrument.address).map_err(|reason| {
            SmuError::configuration(format!(
                "instrument address '{}': {}",
                self.instrument.address, reason
            ))
        })?;
        self.session.validate()
    }
}
