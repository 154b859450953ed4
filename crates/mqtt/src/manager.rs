//! High-level entry point that wires the broker client together.
//!
//! `MqttManager` validates the configuration, builds the client, spawns the
//! [`ConnectionKernel`] and returns an [`MqttInstance`] the application uses for
//! publishing, state monitoring and shutdown.
//!
//! ```ignore
//! let instance = MqttManager::from_config(config)?.build_and_start().await?;
//! let mut state_rx = instance.subscribe_state();
//! let publisher = Publisher::new(Arc::new(instance));
//! ```

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use rumqttc::AsyncClient;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use validator::Validate;

use super::{
    client::ClientBuilder, config::Config, connection::ConnectionKernel, error::TransferError,
    state::ConnectionState,
};

/// Counts in-flight publishes so shutdown can wait for them.
#[derive(Debug, Default)]
pub struct PublishDrain {
    inflight: AtomicUsize,
    notify: Notify,
}

impl PublishDrain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a publish as in flight until the returned guard drops.
    pub fn enter(self: &Arc<Self>) -> PublishGuard {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        PublishGuard {
            drain: self.clone(),
        }
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    pub async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            if self.inflight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct PublishGuard {
    drain: Arc<PublishDrain>,
}

impl Drop for PublishGuard {
    fn drop(&mut self) {
        if self.drain.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drain.notify.notify_waiters();
        }
    }
}

/// Builds the broker infrastructure from a validated [`Config`].
pub struct MqttManager {
    config: Config,
    cancel_token: CancellationToken,
}

impl MqttManager {
    /// # Errors
    ///
    /// Returns `TransferError::ConfigError` when validation fails.
    pub fn from_config(config: Config) -> Result<Self, TransferError> {
        config.validate()?;
        Ok(Self {
            config,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Creates the client, spawns the connection kernel and returns the instance.
    ///
    /// The connection is established asynchronously. Watch
    /// [`MqttInstance::subscribe_state`] to learn when it is up.
    pub async fn build_and_start(self) -> Result<MqttInstance, TransferError> {
        info!(
            "Connecting to broker {} with topic root '{}'",
            self.config.address, self.config.topic
        );

        let (client, event_loop) = ClientBuilder::from_config(&self.config)?.build();

        // Fires only after the publish drain is idle.
        let connection_cancel = CancellationToken::new();
        let mut kernel = ConnectionKernel::new(client.clone(), event_loop, connection_cancel.clone());
        let state_rx = kernel.subscribe_state();
        let publish_drain = Arc::new(PublishDrain::new());

        tokio::spawn(async move {
            kernel.reconnect().await;
            debug!("Connection kernel task finished");
        });

        {
            let shutdown_request = self.cancel_token.clone();
            let drain = publish_drain.clone();
            let conn_cancel = connection_cancel.clone();
            tokio::spawn(async move {
                shutdown_request.cancelled().await;
                drain.wait_idle().await;
                conn_cancel.cancel();
            });
        }

        Ok(MqttInstance {
            client,
            state_rx,
            topic: self.config.topic.clone(),
            cancel_token: self.cancel_token,
            connection_cancel,
            publish_drain,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }
}

/// A running broker connection.
#[derive(Debug, Clone)]
pub struct MqttInstance {
    client: AsyncClient,
    state_rx: watch::Receiver<ConnectionState>,
    /// Topic root prefixed to every publication.
    topic: String,
    cancel_token: CancellationToken,
    connection_cancel: CancellationToken,
    publish_drain: Arc<PublishDrain>,
}

impl MqttInstance {
    pub fn client(&self) -> &AsyncClient {
        &self.client
    }

    /// A fresh receiver for connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Prefixes `suffix` with the topic root.
    pub fn with_topic_root(&self, suffix: &str) -> String {
        join_topic(&self.topic, suffix)
    }

    pub fn publish_drain(&self) -> Arc<PublishDrain> {
        self.publish_drain.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Waits for in-flight publishes, then stops the connection kernel.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        self.publish_drain.wait_idle().await;
        self.connection_cancel.cancel();
    }
}

pub(crate) fn join_topic(root: &str, suffix: &str) -> String {
    if root.is_empty() {
        suffix.trim_start_matches('/').to_string()
    } else {
        format!(
            "{}/{}",
            root.trim_end_matches('/'),
            suffix.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_manager_rejects_invalid_config() {
        let config = Config {
            address: "localhost:1883".into(),
            ..Default::default()
        };
        assert!(matches!(
            MqttManager::from_config(config),
            Err(TransferError::ConfigError(_))
        ));
    }

    #[test]
    fn test_manager_from_config() {
        let manager = MqttManager::from_config(Config::default()).unwrap();
        assert_eq!(manager.config().topic, "STARS4ALL");
        assert!(!manager.cancel_token().is_cancelled());
    }

    #[test]
    fn test_join_topic() {
        assert_eq!(join_topic("STARS4ALL", "register"), "STARS4ALL/register");
        assert_eq!(join_topic("STARS4ALL/", "/stars1/reading"), "STARS4ALL/stars1/reading");
        assert_eq!(join_topic("", "register"), "register");
    }

    #[tokio::test]
    async fn test_publish_drain_waits_for_guards() {
        let drain = Arc::new(PublishDrain::new());
        let guard = drain.enter();
        assert_eq!(drain.inflight(), 1);

        let waiter = {
            let drain = drain.clone();
            tokio::spawn(async move { drain.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(drain.inflight(), 0);
    }

    #[tokio::test]
    async fn test_instance_shutdown() {
        let config = Config {
            address: "tcp:127.0.0.1:1".into(),
            ..Default::default()
        };
        let instance = MqttManager::from_config(config)
            .unwrap()
            .build_and_start()
            .await
            .unwrap();
        assert_eq!(instance.with_topic_root("register"), "STARS4ALL/register");

        tokio::time::timeout(Duration::from_secs(1), instance.shutdown())
            .await
            .unwrap();
        assert!(instance.cancel_token().is_cancelled());
    }
}
