//! Publishes `api_key:<hash> -> subject_id` mappings for the key/value store writer.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::info;

use crate::config::KafkaConfig;
use crate::error::PublishError;
use crate::models::MappingRecord;

pub const MAPPING_EVENT_TYPE: &str = "api_key.mapping";

/// Durable outbound channel for credential mappings
#[async_trait]
pub trait MappingPublisher: Send + Sync {
    /// Returns only once the broker has confirmed the record.
    async fn publish(&self, record: &MappingRecord) -> Result<(), PublishError>;
}

/// Build the shared producer used for mapping records and requeues
///
/// Idempotent, `acks=all`, with delivery reports bounded by `publish_timeout`.
pub fn create_producer(config: &KafkaConfig) -> Result<FutureProducer, rdkafka::error::KafkaError> {
    ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .set("enable.idempotence", "true")
        .set("acks", "all")
        .set("max.in.flight.requests.per.connection", "5")
        .set(
            "message.timeout.ms",
            config.publish_timeout.as_millis().to_string(),
        )
        .create()
}

/// Kafka-backed mapping publisher
///
/// Records are keyed by subject id so every mapping for a subject lands on
/// the same partition.
pub struct KafkaMappingPublisher {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl KafkaMappingPublisher {
    pub fn new(producer: FutureProducer, topic: impl Into<String>, timeout: Duration) -> Self {
        Self {
            producer,
            topic: topic.into(),
            timeout,
        }
    }
}

#[async_trait]
impl MappingPublisher for KafkaMappingPublisher {
    async fn publish(&self, record: &MappingRecord) -> Result<(), PublishError> {
        let payload = serde_json::to_string(record)?;

        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "event_type",
                value: Some(MAPPING_EVENT_TYPE.as_bytes()),
            })
            .insert(Header {
                key: "content_type",
                value: Some("application/json".as_bytes()),
            });

        let kafka_record = FutureRecord::to(&self.topic)
            .key(record.subject_id())
            .payload(&payload)
            .headers(headers);

        // The producer's own message.timeout.ms bounds delivery; the outer
        // timeout also covers a stalled enqueue.
        let delivery = tokio::time::timeout(
            self.timeout,
            self.producer.send(kafka_record, self.timeout),
        )
        .await
        .map_err(|_| PublishError::Timeout(self.timeout))?;

        let (partition, offset) = delivery.map_err(|(err, _)| {
            PublishError::Rejected(format!("Kafka publish failed: {}", err))
        })?;

        info!(
            subject_id = %record.subject_id(),
            topic = %self.topic,
            partition,
            offset,
            "API key mapping published"
        );

        Ok(())
    }
}
