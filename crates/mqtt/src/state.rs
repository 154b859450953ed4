//! Broker connection state.
//!
//! The connection kernel publishes the current [`ConnectionState`] on a `watch`
//! channel. The publish service observes it to decide when to run its
//! registration and streaming phases, and to cancel them on disconnection.
//!
//! ```text
//! Disconnected ──(attempt)──> Connecting ──(CONNACK)──> Connected
//!      ▲                           │                        │
//!      └────────(failure)──────────┘◄──────(lost)───────────┘
//! ```

use std::fmt;

/// Represents the current state of the broker connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No connection. The `String` holds the reason for the last loss or failure.
    ///
    /// While in this state the kernel is waiting out its backoff delay.
    Disconnected(String),

    /// A connection attempt is in progress (CONNECT sent, waiting for CONNACK).
    Connecting,

    /// CONNACK received. Publishes go out to the broker.
    Connected,
}

impl ConnectionState {
    /// Returns a short string identifier for the current state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected(_) => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
        }
    }

    /// Returns the disconnection reason, or an empty string for other states.
    pub fn details(&self) -> &str {
        match self {
            ConnectionState::Disconnected(reason) => reason,
            _ => "",
        }
    }

    /// True only in the `Connected` state.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())?;
        let details = self.details();
        if !details.is_empty() {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}
