//! Inbound queue consumption
//!
//! `QueueConsumer` pulls deliveries from an [`InboundQueue`], runs each one
//! through the [`EventProcessor`] on its own task, and settles it:
//!
//! | outcome              | disposition |
//! |----------------------|-------------|
//! | Success              | ack         |
//! | PermanentFailure     | ack         |
//! | malformed payload    | ack         |
//! | RetryableFailure     | requeue     |
//!
//! At most `max_in_flight` deliveries are unsettled at any time: a permit is
//! taken before the next delivery is pulled and released once it is settled.

pub mod kafka;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

use crate::config::ConsumerConfig;
use crate::error::QueueError;
use crate::metrics;
use crate::models::InboundEvent;
use crate::services::processor::{EventProcessor, ProcessingOutcome, Stage};

pub use kafka::{KafkaInboundQueue, OffsetTracker};
pub use memory::{MemoryDelivery, MemoryQueue};

/// A single message pulled from the inbound queue
#[async_trait]
pub trait Delivery: Send + Sync + 'static {
    fn payload(&self) -> &[u8];

    /// Identifier for logs (never the payload)
    fn tag(&self) -> String;

    /// Remove the message from the queue
    async fn ack(&self) -> Result<(), QueueError>;

    /// Return the message to the queue for redelivery
    async fn requeue(&self) -> Result<(), QueueError>;
}

/// Source of deliveries
#[async_trait]
pub trait InboundQueue: Send + Sync + 'static {
    type Delivery: Delivery;

    /// Next delivery; `None` once the queue has been closed and drained.
    /// Must be cancel safe.
    async fn next(&self) -> Option<Result<Self::Delivery, QueueError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
}

impl Disposition {
    pub fn for_outcome(outcome: &ProcessingOutcome) -> Self {
        match outcome {
            ProcessingOutcome::RetryableFailure(_) => Disposition::Requeue,
            ProcessingOutcome::Success | ProcessingOutcome::PermanentFailure(_) => {
                Disposition::Ack
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Ack => "ack",
            Disposition::Requeue => "requeue",
        }
    }
}

/// Decode, process and settle one delivery
pub async fn handle_delivery<D: Delivery>(processor: &EventProcessor, delivery: &D) -> Disposition {
    let disposition = match InboundEvent::from_slice(delivery.payload()) {
        Ok(event) => Disposition::for_outcome(&processor.process(&event).await),
        Err(e) => {
            metrics::record_event_outcome("malformed");
            metrics::record_stage_failure(Stage::Validation.as_str());
            error!(
                delivery = %delivery.tag(),
                stage = %Stage::Validation,
                error = %e,
                "Dropping undecodable message"
            );
            Disposition::Ack
        }
    };

    let settled = match disposition {
        Disposition::Ack => delivery.ack().await,
        Disposition::Requeue => delivery.requeue().await,
    };

    if let Err(e) = settled {
        error!(
            delivery = %delivery.tag(),
            disposition = disposition.as_str(),
            error = %e,
            "Failed to settle delivery"
        );
    } else {
        metrics::record_disposition(disposition.as_str());
    }

    disposition
}

pub struct QueueConsumer<Q: InboundQueue> {
    queue: Arc<Q>,
    processor: EventProcessor,
    max_in_flight: usize,
    shutdown_grace: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl<Q: InboundQueue> QueueConsumer<Q> {
    pub fn new(
        queue: Arc<Q>,
        processor: EventProcessor,
        config: &ConsumerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            processor,
            max_in_flight: config.max_in_flight.max(1),
            shutdown_grace: config.shutdown_grace,
            shutdown_rx,
        }
    }

    /// Consume until shutdown is signalled or the queue closes, then drain
    /// in-flight deliveries within the grace period.
    pub async fn run(mut self) -> Result<(), QueueError> {
        info!(max_in_flight = self.max_in_flight, "Starting queue consumer");

        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        let mut tasks: JoinSet<Disposition> = JoinSet::new();
        let mut tally = Tally::default();

        loop {
            if *self.shutdown_rx.borrow() {
                info!("Shutdown signal received, stopping consumer");
                break;
            }

            let permit = tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    tally.record(joined);
                    continue;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    drop(permit);
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                next = self.queue.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let processor = self.processor.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        metrics::in_flight_inc();
                        let disposition = handle_delivery(&processor, &delivery).await;
                        metrics::in_flight_dec();
                        disposition
                    });
                }
                Some(Err(e)) => {
                    drop(permit);
                    error!(error = %e, "Inbound queue error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                None => {
                    info!("Inbound queue closed");
                    break;
                }
            }
        }

        let in_flight = tasks.len();
        if in_flight > 0 {
            info!(in_flight, "Draining in-flight deliveries");
        }

        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                tally.record(joined);
            }
        };
        if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
            warn!(
                abandoned = tasks.len(),
                grace_secs = self.shutdown_grace.as_secs(),
                "Shutdown grace period elapsed, abandoning in-flight deliveries"
            );
            tasks.abort_all();
        }

        info!(
            acked = tally.acked,
            requeued = tally.requeued,
            "Queue consumer stopped"
        );
        Ok(())
    }
}

#[derive(Default)]
struct Tally {
    acked: u64,
    requeued: u64,
}

impl Tally {
    fn record(&mut self, joined: Result<Disposition, JoinError>) {
        match joined {
            Ok(Disposition::Ack) => self.acked += 1,
            Ok(Disposition::Requeue) => self.requeued += 1,
            Err(e) => error!(error = %e, "Delivery task failed"),
        }
    }
}
