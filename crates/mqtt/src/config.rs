//! Broker connection configuration.
//!
//! The configuration is deserialized from the `[mqtt]` section of the service
//! configuration file and validated once at load time. After that it is treated
//! as immutable.
//!
//! ```toml
//! [mqtt]
//! address = "tcp:test.mosquitto.org:1883"
//! username = ""          # empty = anonymous connection
//! password = ""
//! keepalive = 60
//! topic = "STARS4ALL"
//! log_level = "info"
//! log_messages = "warn"
//! ```

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use super::error::TransferError;

/// Main broker connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// Broker endpoint in `tcp:<host>:<port>` form.
    #[validate(custom(function = "validate_address"))]
    pub address: String,

    /// Broker user name. An empty string means an anonymous connection.
    pub username: String,

    /// Broker password. Ignored when `username` is empty.
    pub password: String,

    /// Keep-alive interval in seconds.
    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keepalive: u64,

    /// Root of every published topic (`<topic>/register`, `<topic>/<name>/reading`).
    #[validate(length(
        min = 1,
        max = 255,
        message = "Topic root must be between 1 and 255 characters"
    ))]
    pub topic: String,

    /// MQTT client identifier. An empty string generates a UUID.
    #[validate(length(max = 36, message = "Client ID must not exceed 36 characters"))]
    pub client_id: String,

    /// How many requests the client may queue for the event loop.
    #[validate(range(
        min = 1,
        max = 1000,
        message = "Request channel capacity must be between 1 and 1000"
    ))]
    pub request_channel_capacity: usize,

    /// Log level for the broker client itself.
    #[validate(custom(function = "validate_log_level"))]
    pub log_level: String,

    /// Log level for protocol traffic (the underlying MQTT event loop).
    #[validate(custom(function = "validate_log_level"))]
    pub log_messages: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            address: "tcp:localhost:1883".to_string(),
            username: String::new(),
            password: String::new(),
            keepalive: 60,
            topic: "STARS4ALL".to_string(),
            client_id: "tessw-publisher".to_string(),
            request_channel_capacity: 10,
            log_level: "info".to_string(),
            log_messages: "warn".to_string(),
        }
    }
}

impl Config {
    /// Splits `address` into host and port.
    pub fn host_port(&self) -> Result<(String, u16), TransferError> {
        parse_address(&self.address)
    }

    /// Credentials to send in CONNECT, or `None` for an anonymous connection.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        if self.username.is_empty() {
            None
        } else {
            Some((self.username.as_str(), self.password.as_str()))
        }
    }
}

/// Parses a `tcp:<host>:<port>` endpoint string.
pub fn parse_address(address: &str) -> Result<(String, u16), TransferError> {
    let invalid = || TransferError::InvalidAddress(address.to_string());

    let rest = address.trim().strip_prefix("tcp:").ok_or_else(invalid)?;
    let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim();
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.trim().parse::<u16>().map_err(|_| invalid())?;
    if port == 0 {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

fn validate_address(address: &str) -> Result<(), ValidationError> {
    parse_address(address).map(|_| ()).map_err(|e| {
        let mut err = ValidationError::new("invalid_address");
        err.message = Some(e.to_string().into());
        err
    })
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => {
            let mut err = ValidationError::new("invalid_log_level");
            err.message = Some(format!("Invalid log level: {}", level).into());
            Err(err)
        }
    }
}
