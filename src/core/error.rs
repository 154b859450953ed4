use std::time::Duration;

use thiserror::Error;

/// Failures of a single photometer session. None of them stops other sessions.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The endpoint is not `serial:<device>:<baud>`. Fatal at startup.
    #[error("Invalid endpoint '{endpoint}': {reason}")]
    Endpoint { endpoint: String, reason: String },

    /// No reading arrived to derive the registration info from.
    #[error("No registration info from {label} within {}s", .timeout.as_secs())]
    InfoTimeout { label: String, timeout: Duration },

    /// A newer registration request replaced this one.
    #[error("Registration info request for {label} was superseded")]
    InfoSuperseded { label: String },

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Every sensor reached the miss limit at the same time.
    #[error("All {sensors} photometers missed {max_misses} consecutive polls")]
    TotalOutage { sensors: usize, max_misses: u32 },

    #[error("The {0} queue is closed")]
    ChannelClosed(&'static str),

    #[error("No photometers to supervise")]
    NoSensors,
}
