//! Global service settings: how many photometers are polled and how often.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use super::validate_log_level;

/// `[service]` section.
///
/// ```toml
/// [service]
/// sensor_count = 2
/// period = 60        # one full round-robin cycle, in seconds
/// max_misses = 10
/// log_level = "info"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServiceConfig {
    /// Number of `[[photometers]]` entries the service expects.
    #[validate(range(min = 1, max = 64, message = "Sensor count must be between 1 and 64"))]
    pub sensor_count: usize,

    /// Seconds per full polling cycle over all sensors.
    #[validate(range(min = 1, message = "Period must be at least 1 second"))]
    pub period: u64,

    /// Consecutive empty polls after which a sensor counts as dead.
    #[validate(range(min = 1, message = "Max misses must be at least 1"))]
    pub max_misses: u32,

    /// Log level for the supervisor and publish service.
    #[validate(custom(function = "validate_log_level"))]
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            sensor_count: 1,
            period: 60,
            max_misses: 10,
            log_level: "info".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Interval between two poll ticks: `period / sensor_count`, in whole seconds.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.period / self.sensor_count.max(1) as u64)
    }
}
