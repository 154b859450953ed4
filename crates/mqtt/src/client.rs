//! MQTT client builder.
//!
//! `ClientBuilder` turns a validated [`Config`] into rumqttc's `AsyncClient` and
//! `EventLoop` pair. The client is cheap to clone and is handed to publishers;
//! the event loop is owned by the connection kernel.
//!
//! ```ignore
//! let (client, event_loop) = ClientBuilder::from_config(&config)?.build();
//! ```

use std::time::Duration;

use rumqttc::{AsyncClient, EventLoop, MqttOptions};
use tracing::debug;

use super::{config::Config, error::TransferError};

/// Builder for constructing the MQTT client with a fluent API.
pub struct ClientBuilder {
    /// MQTT protocol options (host, port, keep-alive, credentials).
    opts: MqttOptions,

    /// Capacity of the request channel between client and event loop.
    cap: usize,
}

impl ClientBuilder {
    /// Creates a builder with minimal settings.
    ///
    /// An empty `client_id` is replaced by a random UUID.
    pub fn new(client_id: &str, host: impl Into<String>, port: u16, cap: usize) -> Self {
        let client_id = if client_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            client_id.to_string()
        };
        Self {
            opts: MqttOptions::new(client_id, host, port),
            cap: cap.max(1),
        }
    }

    /// Creates a builder from the broker configuration.
    ///
    /// Credentials are only set when a user name is configured, so an empty
    /// user name produces an anonymous CONNECT.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::InvalidAddress` if the address cannot be parsed.
    pub fn from_config(config: &Config) -> Result<Self, TransferError> {
        let (host, port) = config.host_port()?;
        let mut builder = Self::new(&config.client_id, host, port, config.request_channel_capacity)
            .keep_alive(config.keepalive)
            .clean_session(true);

        if let Some((username, password)) = config.credentials() {
            debug!("Using broker credentials for user '{}'", username);
            builder = builder.credentials(username, password);
        } else {
            debug!("Anonymous broker connection");
        }

        Ok(builder)
    }

    /// Sets the keep-alive interval in seconds.
    pub fn keep_alive(mut self, secs: u64) -> Self {
        self.opts.set_keep_alive(Duration::from_secs(secs));
        self
    }

    /// Configures whether to request a clean session.
    pub fn clean_session(mut self, clean: bool) -> Self {
        self.opts.set_clean_session(clean);
        self
    }

    /// Sets the CONNECT credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.opts.set_credentials(username, password);
        self
    }

    /// Read access to the accumulated options.
    pub fn options(&self) -> &MqttOptions {
        &self.opts
    }

    /// Consumes the builder and creates the client and its event loop.
    pub fn build(self) -> (AsyncClient, EventLoop) {
        AsyncClient::new(self.opts, self.cap)
    }
}
