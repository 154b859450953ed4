//! Per-photometer settings.

use serde::{Deserialize, Serialize};
use validator::Validate;

use super::validate_log_level;

/// One `[[photometers]]` entry.
///
/// ```toml
/// [[photometers]]
/// legacy_firmware = false
/// mac_address = "5C:CF:7F:76:65:54"
/// name = "stars1"
/// zero_point = 20.5
/// endpoint = "serial:/dev/ttyUSB0:9600"
/// log_level = "info"
/// log_messages = "warn"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PhotometerConfig {
    /// Log label. Empty means `phot<index>`, filled in at load time.
    pub label: String,

    /// Sensor speaks the fixed-token line format instead of JSON.
    pub legacy_firmware: bool,

    #[validate(length(min = 1, message = "MAC address must not be empty"))]
    pub mac_address: String,

    /// Sensor name as published. New firmware may override it per reading.
    #[validate(length(min = 1, max = 64, message = "Name must be between 1 and 64 characters"))]
    pub name: String,

    /// Calibration constant. New firmware may override it per reading.
    #[validate(range(min = 0.0, max = 30.0, message = "Zero point must be between 0 and 30"))]
    pub zero_point: f64,

    /// `serial:<device>:<baud>`. Checked when the session is built.
    pub endpoint: String,

    /// Level for the sensor's session logs.
    ///
    /// Only raises verbosity: events the `[service]` level already lets through
    /// are still logged when this is stricter.
    #[validate(custom(function = "validate_log_level"))]
    pub log_level: String,

    /// Level for raw serial traffic (`debug` shows every line). Like
    /// `log_level`, it cannot go below the `[service]` level.
    #[validate(custom(function = "validate_log_level"))]
    pub log_messages: String,
}

impl Default for PhotometerConfig {
    fn default() -> Self {
        PhotometerConfig {
            label: String::new(),
            legacy_firmware: false,
            mac_address: "00:00:00:00:00:00".to_string(),
            name: "stars0".to_string(),
            zero_point: 20.5,
            endpoint: "serial:/dev/ttyUSB0:9600".to_string(),
            log_level: "info".to_string(),
            log_messages: "warn".to_string(),
        }
    }
}
