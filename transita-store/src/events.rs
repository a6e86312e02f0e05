use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, error, warn};
use transita_core::audit::AuditSink;
use transita_shared::models::events::AuditEvent;

#[derive(Clone)]
pub struct EventProducer {
    producer: FutureProducer,
}

impl EventProducer {
    pub fn new(brokers: &str) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self { producer })
    }

    pub async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<(), rdkafka::error::KafkaError> {
        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload);

        match self.producer.send(record, Timeout::After(Duration::from_secs(0))).await {
            Ok(delivery) => {
                debug!("Sent {} to {}: partition {} offset {}", key, topic, delivery.partition, delivery.offset);
                Ok(())
            }
            Err((e, _msg)) => {
                error!("Failed to send message to {}: {}", topic, e);
                Err(e)
            }
        }
    }
}

/// Audit events as Kafka records, one topic per event type, keyed by the
/// owning aggregate id so related events stay ordered.
pub struct KafkaAuditSink {
    producer: EventProducer,
    topic_prefix: String,
}

impl KafkaAuditSink {
    pub fn new(producer: EventProducer) -> Self {
        Self { producer, topic_prefix: "transita".to_string() }
    }

    fn topic_for(&self, event: &AuditEvent) -> String {
        format!("{}.{}", self.topic_prefix, event.topic())
    }
}

#[async_trait]
impl AuditSink for KafkaAuditSink {
    async fn publish(&self, event: AuditEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic = event.topic(), "failed to serialize audit event: {}", e);
                return;
            }
        };
        let topic = self.topic_for(&event);
        if let Err(e) = self.producer.publish(&topic, &event.key(), &payload).await {
            warn!(topic = %topic, "audit event dropped: {}", e);
        }
    }
}
