//! Kafka transport for inbound webhook events
//!
//! Offsets are committed manually. A delivery is settled either by acking it
//! or, for a requeue, by republishing the payload to the inbound topic with
//! an incremented `x-redelivery-count` header. Either way its offset is only
//! resolved once the message is safe, and a partition is committed only up
//! to its lowest still-unresolved offset.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use super::{Delivery, InboundQueue};
use crate::config::{ConsumerConfig, KafkaConfig};
use crate::error::QueueError;

pub const REDELIVERY_HEADER: &str = "x-redelivery-count";

const MIN_REQUEUE_BACKOFF: Duration = Duration::from_millis(100);
const MAX_REQUEUE_BACKOFF: Duration = Duration::from_secs(30);

/// Per-partition bookkeeping for out-of-order completion
///
/// Offsets are tracked when received and completed when settled. The commit
/// position for a partition never passes an offset that is still in flight.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionOffsets>,
}

#[derive(Debug, Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    highest_done: Option<i64>,
    committed: Option<i64>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, topic: &str, partition: i32, offset: i64) {
        let entry = self
            .partitions
            .entry((topic.to_string(), partition))
            .or_default();
        entry.in_flight.insert(offset);
        if entry.committed.is_none() {
            entry.committed = Some(offset);
        }
    }

    /// Mark `offset` settled; returns the new commit position if it advanced
    pub fn complete(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let entry = self.partitions.get_mut(&(topic.to_string(), partition))?;
        if !entry.in_flight.remove(&offset) {
            return None;
        }

        let done = entry.highest_done.map_or(offset, |h| h.max(offset));
        entry.highest_done = Some(done);

        let next = match entry.in_flight.first() {
            Some(&lowest) => lowest,
            None => done + 1,
        };

        if entry.committed.map_or(true, |c| next > c) {
            entry.committed = Some(next);
            Some(next)
        } else {
            None
        }
    }

    pub fn in_flight(&self, topic: &str, partition: i32) -> usize {
        self.partitions
            .get(&(topic.to_string(), partition))
            .map_or(0, |p| p.in_flight.len())
    }
}

struct KafkaShared {
    consumer: StreamConsumer,
    producer: FutureProducer,
    requeue_delay: Duration,
    publish_timeout: Duration,
    offsets: Mutex<OffsetTracker>,
}

impl KafkaShared {
    fn offsets(&self) -> MutexGuard<'_, OffsetTracker> {
        self.offsets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn resolve(&self, topic: &str, partition: i32, offset: i64) -> Result<(), QueueError> {
        let Some(position) = self.offsets().complete(topic, partition, offset) else {
            return Ok(());
        };

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(position))?;
        self.consumer.commit(&tpl, CommitMode::Async)?;
        debug!(topic, partition, position, "Committed offset");
        Ok(())
    }
}

/// Inbound webhook events from a Kafka consumer group
pub struct KafkaInboundQueue {
    shared: Arc<KafkaShared>,
}

impl KafkaInboundQueue {
    /// Subscribe to `config.webhook_topic`; `producer` is used for requeues
    pub fn new(
        config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
        producer: FutureProducer,
    ) -> Result<Self, QueueError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "30000")
            .set("max.poll.interval.ms", "300000")
            .create()?;

        consumer.subscribe(&[config.webhook_topic.as_str()])?;

        info!(
            brokers = %config.brokers,
            topic = %config.webhook_topic,
            group_id = %config.group_id,
            "Kafka consumer subscribed"
        );

        Ok(Self {
            shared: Arc::new(KafkaShared {
                consumer,
                producer,
                requeue_delay: consumer_config.requeue_delay,
                publish_timeout: config.publish_timeout,
                offsets: Mutex::new(OffsetTracker::new()),
            }),
        })
    }
}

#[async_trait]
impl InboundQueue for KafkaInboundQueue {
    type Delivery = KafkaDelivery;

    async fn next(&self) -> Option<Result<KafkaDelivery, QueueError>> {
        let message = match self.shared.consumer.recv().await {
            Ok(message) => message.detach(),
            Err(e) => return Some(Err(QueueError::Kafka(e))),
        };

        self.shared
            .offsets()
            .track(message.topic(), message.partition(), message.offset());

        Some(Ok(KafkaDelivery {
            shared: Arc::clone(&self.shared),
            message,
        }))
    }
}

pub struct KafkaDelivery {
    shared: Arc<KafkaShared>,
    message: OwnedMessage,
}

#[async_trait]
impl Delivery for KafkaDelivery {
    fn payload(&self) -> &[u8] {
        self.message.payload().unwrap_or_default()
    }

    fn tag(&self) -> String {
        format!(
            "{}/{}@{}",
            self.message.topic(),
            self.message.partition(),
            self.message.offset()
        )
    }

    async fn ack(&self) -> Result<(), QueueError> {
        self.shared.resolve(
            self.message.topic(),
            self.message.partition(),
            self.message.offset(),
        )
    }

    async fn requeue(&self) -> Result<(), QueueError> {
        tokio::time::sleep(self.shared.requeue_delay).await;

        let attempt = self.redelivery_count() + 1;
        let mut backoff = self.shared.requeue_delay.max(MIN_REQUEUE_BACKOFF);

        // The offset holds back every later commit on this partition until
        // the republish is confirmed, so keep trying. Shutdown aborts the
        // task and leaves the offset uncommitted for the next consumer.
        loop {
            match self.republish(attempt).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(
                        delivery = %self.tag(),
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Requeue publish failed"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff);
                }
            }
        }

        debug!(delivery = %self.tag(), attempt, "Message requeued");
        self.ack().await
    }
}

impl KafkaDelivery {
    pub fn redelivery_count(&self) -> u32 {
        redelivery_count(self.message.headers())
    }

    async fn republish(&self, attempt: u32) -> Result<(), QueueError> {
        let headers = requeue_headers(self.message.headers(), attempt);

        let mut record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(self.message.topic())
            .payload(self.payload())
            .headers(headers);
        if let Some(key) = self.message.key() {
            record = record.key(key);
        }

        let timeout = self.shared.publish_timeout;
        tokio::time::timeout(timeout, self.shared.producer.send(record, timeout))
            .await
            .map_err(|_| QueueError::Requeue(format!("not confirmed within {:?}", timeout)))?
            .map(|_| ())
            .map_err(|(e, _)| QueueError::Requeue(e.to_string()))
    }
}

/// Doubling delay between republish attempts, capped
fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2).min(MAX_REQUEUE_BACKOFF)
}

fn redelivery_count(headers: Option<&OwnedHeaders>) -> u32 {
    headers
        .into_iter()
        .flat_map(|h| h.iter())
        .find(|h| h.key == REDELIVERY_HEADER)
        .and_then(|h| h.value)
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn requeue_headers(existing: Option<&OwnedHeaders>, attempt: u32) -> OwnedHeaders {
    let mut headers = OwnedHeaders::new();
    for header in existing.into_iter().flat_map(|h| h.iter()) {
        if header.key == REDELIVERY_HEADER {
            continue;
        }
        headers = headers.insert(Header {
            key: header.key,
            value: header.value,
        });
    }

    let attempt = attempt.to_string();
    headers.insert(Header {
        key: REDELIVERY_HEADER,
        value: Some(attempt.as_bytes()),
    })
}
