//! Forwards registration and telemetry messages to the broker.
//!
//! The publish service follows the broker connection state. On every connection
//! it first completes one registration round (one message per sensor) and only
//! then streams telemetry. Connections after the first ask the supervisor for a
//! fresh round so the broker-side registry is rebuilt.
//!
//! Telemetry queued while disconnected or while registering is kept and sent
//! once streaming resumes.

use std::{error::Error, sync::Arc};

use erased_serde::Serialize;
use tessw_mqtt::ConnectionState;
use tokio::sync::{
    mpsc::{UnboundedReceiver, UnboundedSender},
    watch,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::message::{BrokerEvent, RegistrationMessage, RegistrationOutcome, Telemetry};

/// Topic suffix for registration messages.
pub const REGISTER_TOPIC: &str = "register";

/// Sends serializable data to a topic below the broker's topic root.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        data: &(dyn Serialize + Send + Sync),
        topic: &str,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}

#[async_trait::async_trait]
impl Publisher for tessw_mqtt::Publisher {
    async fn publish(
        &self,
        data: &(dyn Serialize + Send + Sync),
        topic: &str,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        tessw_mqtt::Publisher::publish(self, data, topic)
            .await
            .map_err(|e| Box::new(e) as _)
    }
}

pub struct PublishService {
    publisher: Arc<dyn Publisher>,
    sensor_count: usize,
    round: u64,
    register_rx: UnboundedReceiver<RegistrationMessage>,
    telemetry_rx: UnboundedReceiver<Telemetry>,
    events_tx: UnboundedSender<BrokerEvent>,
}

impl PublishService {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        sensor_count: usize,
        register_rx: UnboundedReceiver<RegistrationMessage>,
        telemetry_rx: UnboundedReceiver<Telemetry>,
        events_tx: UnboundedSender<BrokerEvent>,
    ) -> Self {
        Self {
            publisher,
            sensor_count,
            round: 0,
            register_rx,
            telemetry_rx,
            events_tx,
        }
    }

    /// Runs until cancelled, until the connection state channel closes, or
    /// until the supervisor drops its end of the message channels.
    pub async fn run(
        mut self,
        mut state_rx: watch::Receiver<ConnectionState>,
        cancel: CancellationToken,
    ) {
        let mut connections: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                state = wait_for_state(&mut state_rx, true) => {
                    if state.is_none() {
                        warn!("Connection state channel closed");
                        break;
                    }
                }
            }

            connections += 1;
            if connections > 1 {
                self.round += 1;
                info!(
                    "Reconnected to broker, requesting registration round {}",
                    self.round
                );
                let event = BrokerEvent::Reregister { round: self.round };
                if self.events_tx.send(event).is_err() {
                    debug!("Supervisor gone, not requesting re-registration");
                }
            } else {
                info!("Connected to broker");
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                state = wait_for_state(&mut state_rx, false) => match state {
                    Some(state) => warn!("Broker connection lost: {}", state),
                    None => {
                        warn!("Connection state channel closed");
                        break;
                    }
                },
                _ = self.serve() => {
                    info!("Message channels closed, publish service finished");
                    break;
                }
            }
        }
        debug!("Publish service stopped");
    }

    /// Registration phase followed by streaming. Returns only when a channel
    /// closes.
    async fn serve(&mut self) {
        if !self.register_round().await {
            return;
        }

        info!("Streaming readings");
        while let Some(telemetry) = self.telemetry_rx.recv().await {
            let topic = telemetry.topic();
            if let Err(e) = self.publisher.publish(&telemetry, &topic).await {
                error!("Failed to publish reading to {}: {}", topic, e);
            }
        }
    }

    /// Publishes the current round's registration messages. Messages from
    /// earlier rounds are discarded.
    async fn register_round(&mut self) -> bool {
        info!("Registering {} photometers", self.sensor_count);
        let mut received = 0;

        while received < self.sensor_count {
            let Some(msg) = self.register_rx.recv().await else {
                return false;
            };
            if msg.round < self.round {
                debug!(
                    "Discarding registration of {} from stale round {}",
                    msg.label, msg.round
                );
                continue;
            }

            received += 1;
            match msg.outcome {
                RegistrationOutcome::Info(info) => {
                    info!("Registering photometer {} ({})", info.name, msg.label);
                    if let Err(e) = self.publisher.publish(&info, REGISTER_TOPIC).await {
                        error!("Failed to publish registration of {}: {}", info.name, e);
                    }
                }
                RegistrationOutcome::Unavailable => {
                    warn!("No registration info for {}, skipping", msg.label)
                }
            }
        }

        info!("Registration round {} complete", self.round);
        if self
            .events_tx
            .send(BrokerEvent::RegistryComplete { round: self.round })
            .is_err()
        {
            debug!("Supervisor gone, registry completion not delivered");
        }
        true
    }
}

async fn wait_for_state(
    rx: &mut watch::Receiver<ConnectionState>,
    connected: bool,
) -> Option<ConnectionState> {
    rx.wait_for(|s| s.is_connected() == connected)
        .await
        .ok()
        .map(|s| s.clone())
}
