//! JSON publishing under the configured topic root.
//!
//! Every message is serialized to JSON and sent with QoS 0 and no retain flag.
//! With the topic root `STARS4ALL`:
//! - `register` becomes `STARS4ALL/register`
//! - `stars1/reading` becomes `STARS4ALL/stars1/reading`
//!
//! ```ignore
//! let publisher = Publisher::new(Arc::new(instance));
//! publisher.publish(&reading, "stars1/reading").await?;
//! ```

use std::sync::Arc;

use rumqttc::QoS;
use serde::Serialize;
use tracing::debug;

use super::{
    manager::{join_topic, MqttInstance, PublishDrain},
    TransferError,
};

/// Cheap to clone and share across tasks.
#[derive(Clone)]
pub struct Publisher {
    instance: Arc<MqttInstance>,
    topic_root: String,
    publish_drain: Arc<PublishDrain>,
}

impl Publisher {
    pub fn new(instance: Arc<MqttInstance>) -> Self {
        let topic_root = instance.topic().to_string();
        let publish_drain = instance.publish_drain();
        Self {
            instance,
            topic_root,
            publish_drain,
        }
    }

    pub fn topic_root(&self) -> &str {
        &self.topic_root
    }

    pub fn instance(&self) -> &MqttInstance {
        &self.instance
    }

    /// Serializes `data` to JSON and queues it for `<topic root>/<topic>`.
    ///
    /// Returns once the message is handed to the client. Delivery is best effort
    /// (QoS 0).
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        data: &T,
        topic: &str,
    ) -> Result<(), TransferError> {
        let _guard = self.publish_drain.enter();

        let payload = serde_json::to_vec(data)?;
        let full_topic = join_topic(&self.topic_root, topic);
        debug!("Publishing {} bytes to {}", payload.len(), full_topic);

        self.instance
            .client()
            .publish(full_topic, QoS::AtMostOnce, false, payload)
            .await?;
        Ok(())
    }
}
