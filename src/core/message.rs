//! Messages exchanged between the supervisor, the publish service and the broker.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Firmware revision announced in every registration and legacy reading.
pub const PROTOCOL_REVISION: u32 = 2;

/// Device identity published on `<root>/register`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationInfo {
    pub name: String,
    pub mac: String,
    /// Zero point.
    pub calib: f64,
    pub rev: u32,
}

/// Curated reading published on `<root>/<name>/reading`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Telemetry {
    pub seq: u64,
    pub name: String,
    pub freq: f64,
    pub mag: f64,
    /// Enclosure temperature, new firmware.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tamb: Option<f64>,
    /// Enclosure temperature, legacy firmware.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tbox: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tsky: Option<f64>,
    pub rev: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azi: Option<f64>,
    #[serde(rename = "wdBm", skip_serializing_if = "Option::is_none")]
    pub wdbm: Option<i64>,
    /// Anything else the device sent.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Telemetry {
    /// Topic suffix below the root.
    pub fn topic(&self) -> String {
        format!("{}/reading", self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationOutcome {
    Info(RegistrationInfo),
    /// Timed out or superseded. Still counted so the round completes.
    Unavailable,
}

/// One sensor's result in a registration round.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationMessage {
    pub round: u64,
    pub label: String,
    pub outcome: RegistrationOutcome,
}

/// Sent by the publish service to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Reconnected: run registration round `round` again.
    Reregister { round: u64 },
    /// All registration messages of `round` were handled.
    RegistryComplete { round: u64 },
}
