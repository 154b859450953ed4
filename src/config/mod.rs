//! Application configuration loading and validation.
//!
//! The top-level [`Config`] aggregates logging, service, photometer and broker
//! settings. It is loaded once from a TOML file at startup, validated, and treated
//! as immutable afterwards.
//!
//! ```toml
//! [service]
//! sensor_count = 1
//! period = 60
//!
//! [[photometers]]
//! name = "stars1"
//! mac_address = "5C:CF:7F:76:65:54"
//! endpoint = "serial:/dev/ttyUSB0:9600"
//!
//! [mqtt]
//! address = "tcp:test.mosquitto.org:1883"
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use self::{logger::LoggerConfig, photometer::PhotometerConfig, service::ServiceConfig};

pub mod logger;
pub mod photometer;
pub mod service;

/// Simple macros for printing timestamped messages before the tracing subscriber
/// is initialized. These are used during early configuration loading.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

/// Current UTC time for the `print_*` macros.
#[doc(hidden)]
pub fn timestamp() -> String {
    let format = time::macros::format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
    );
    time::OffsetDateTime::now_utc()
        .format(format)
        .unwrap_or_default()
}

/// Environment variable holding the configuration file path.
pub const CONFIG_ENV: &str = "TESSW_CONFIG";

/// Used when `TESSW_CONFIG` is not set.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/tessw/config.toml";

/// Errors that can occur during configuration loading, parsing or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

/// Top-level application configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
#[validate(schema(function = "validate_topology"))]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    #[validate(nested)]
    pub service: ServiceConfig,

    /// One entry per sensor, in polling order.
    #[validate(nested)]
    pub photometers: Vec<PhotometerConfig>,

    #[validate(nested)]
    pub mqtt: tessw_mqtt::Config,
}

impl Config {
    /// Locates the configuration file and loads it.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be found, read, parsed or validated.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::load(&config_path)
    }

    /// Priority: `TESSW_CONFIG`, then `/etc/tessw/config.toml`.
    fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(format!(
            "No configuration file found. Set {} or create {}",
            CONFIG_ENV, DEFAULT_CONFIG_PATH
        )))
    }

    /// Loads and validates configuration from `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let config = Self::from_toml(&fs::read_to_string(path)?)?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Parses, fills in default labels and validates.
    pub fn from_toml(text: &str) -> Result<Config, ConfigError> {
        let mut config: Config = toml::from_str(text)?;
        config.assign_labels();
        config.validate()?;
        Ok(config)
    }

    fn assign_labels(&mut self) {
        for (i, phot) in self.photometers.iter_mut().enumerate() {
            if phot.label.is_empty() {
                phot.label = format!("phot{}", i + 1);
            }
        }
    }
}

fn validate_topology(config: &Config) -> Result<(), ValidationError> {
    let service = &config.service;
    if config.photometers.len() != service.sensor_count {
        let mut err = ValidationError::new("sensor_count_mismatch");
        err.message = Some(
            format!(
                "sensor_count is {} but {} [[photometers]] entries are configured",
                service.sensor_count,
                config.photometers.len()
            )
            .into(),
        );
        return Err(err);
    }
    if service.tick_interval().is_zero() {
        let mut err = ValidationError::new("period_too_short");
        err.message = Some(
            format!(
                "period ({}s) must give every sensor at least one second",
                service.period
            )
            .into(),
        );
        return Err(err);
    }
    let mut labels: Vec<&str> = config.photometers.iter().map(|p| p.label.as_str()).collect();
    labels.sort_unstable();
    if labels.windows(2).any(|w| w[0] == w[1]) {
        let mut err = ValidationError::new("duplicate_label");
        err.message = Some("photometer labels must be unique".into());
        return Err(err);
    }
    Ok(())
}

pub(crate) fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => {
            let mut err = ValidationError::new("invalid_log_level");
            err.message = Some(format!("Invalid log level: {}", level).into());
            Err(err)
        }
    }
}
