//! Logging sink configuration.
//!
//! Levels for individual components live next to the components themselves
//! (`[service]`, `[[photometers]]`, `[mqtt]`). This section only chooses where log
//! lines go and how they look.

use serde::{Deserialize, Serialize};
use validator::Validate;

use super::validate_log_level;

/// Console output format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

/// `[logger]` section.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggerConfig {
    /// Fallback level for everything not covered by a component level.
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,

    #[validate(nested)]
    pub console: Option<ConsoleConfig>,

    #[validate(nested)]
    pub journald: Option<JournaldConfig>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: "warn".to_string(),
            console: Some(ConsoleConfig::default()),
            journald: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    pub format: LogFormat,
    /// Include the module path.
    pub show_target: bool,
    pub show_thread_ids: bool,
    /// Log span close events (with busy/idle timings).
    pub show_spans: bool,
    pub ansi_colors: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        ConsoleConfig {
            enabled: true,
            format: LogFormat::default(),
            show_target: false,
            show_thread_ids: false,
            show_spans: false,
            ansi_colors: true,
        }
    }
}

/// systemd journald output.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct JournaldConfig {
    pub enabled: bool,

    /// `SYSLOG_IDENTIFIER` of the journal entries.
    #[validate(length(min = 1))]
    pub identifier: String,
}

impl Default for JournaldConfig {
    fn default() -> Self {
        JournaldConfig {
            enabled: false,
            identifier: "tessw".to_string(),
        }
    }
}
