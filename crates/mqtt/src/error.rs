//! Error type for broker transfer operations.
//!
//! `TransferError` aggregates configuration, client, serialization and
//! connection failures into one type the application can match on.
//!
//! None of these errors is fatal to the service on its own. Configuration
//! errors surface at startup; connection errors are retried by the kernel;
//! publish errors are logged by the caller and the next message is tried.

use thiserror::Error;

/// The unified error type for broker transfer operations.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The broker address is not of the form `tcp:<host>:<port>`.
    #[error("Invalid broker address '{0}': expected tcp:<host>:<port>")]
    InvalidAddress(String),

    /// Configuration validation failed.
    #[error("Configuration error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    /// Payload could not be encoded to JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The client could not queue a request (event loop gone or channel closed).
    #[error("Client transfer error: {0}")]
    ClientTransfer(#[from] rumqttc::ClientError),

    /// Network-level connection error reported by the event loop.
    ///
    /// Boxed to keep the enum small.
    #[error("Client connection error: {0}")]
    ClientConnection(#[from] Box<rumqttc::ConnectionError>),
}

impl From<rumqttc::ConnectionError> for TransferError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        TransferError::ClientConnection(Box::new(err))
    }
}
