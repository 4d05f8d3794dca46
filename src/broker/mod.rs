//! Message broker plumbing: the publish seam the daemon talks to, the MQTT
//! client behind it, and broker host resolution.

pub mod lookup;
pub mod mqtt;

pub use mqtt::MqttPublisher;

use crate::error::PublishError;
use std::future::Future;

/// Something the daemon can publish to.
pub trait Publisher: Send + Sync + 'static {
    /// Queues a message without waiting for the broker.
    fn publish(
        &self,
        topic: &str,
        payload: String,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;

    /// Publishes a message and resolves once the broker acknowledged it.
    fn publish_and_wait(
        &self,
        topic: &str,
        payload: String,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Message {
        pub topic: String,
        pub payload: String,
        pub acknowledged: bool,
    }

    /// Records every message in publish order.
    #[derive(Debug, Default)]
    pub struct RecordingPublisher {
        messages: Mutex<Vec<Message>>,
    }

    impl RecordingPublisher {
        pub fn messages(&self) -> Vec<Message> {
            self.messages.lock().unwrap().clone()
        }

        pub fn on_topic(&self, topic: &str) -> Vec<Message> {
            self.messages()
                .into_iter()
                .filter(|m| m.topic == topic)
                .collect()
        }

        pub fn clear(&self) {
            self.messages.lock().unwrap().clear();
        }

        fn record(&self, topic: &str, payload: String, acknowledged: bool) {
            self.messages.lock().unwrap().push(Message {
                topic: topic.to_string(),
                payload,
                acknowledged,
            });
        }
    }

    impl Publisher for RecordingPublisher {
        async fn publish(&self, topic: &str, payload: String) -> Result<(), PublishError> {
            self.record(topic, payload, false);
            Ok(())
        }

        async fn publish_and_wait(&self, topic: &str, payload: String) -> Result<(), PublishError> {
            self.record(topic, payload, true);
            Ok(())
        }
    }
}
