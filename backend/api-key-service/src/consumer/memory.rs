//! In-process queue with broker-style ack/requeue semantics
//!
//! Used by the integration tests and for running the pipeline without a
//! broker. A delivered message stays in flight until it is acked (removed)
//! or requeued (put back at the tail with its delivery count bumped).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{Delivery, InboundQueue};
use crate::error::QueueError;

#[derive(Debug, Clone)]
struct QueuedMessage {
    id: u64,
    payload: Vec<u8>,
    deliveries: u32,
}

#[derive(Default)]
struct MemoryState {
    pending: VecDeque<QueuedMessage>,
    in_flight: HashMap<u64, QueuedMessage>,
    next_id: u64,
    acked: Vec<Vec<u8>>,
    redeliveries: usize,
    peak_in_flight: usize,
    closed: bool,
}

#[derive(Default)]
struct MemoryShared {
    state: Mutex<MemoryState>,
    notify: Notify,
}

impl MemoryShared {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone, Default)]
pub struct MemoryQueue {
    shared: Arc<MemoryShared>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, payload: impl Into<Vec<u8>>) {
        {
            let mut state = self.shared.state();
            let id = state.next_id;
            state.next_id += 1;
            state.pending.push_back(QueuedMessage {
                id,
                payload: payload.into(),
                deliveries: 0,
            });
        }
        self.shared.notify.notify_waiters();
    }

    /// Mark the stream finished; `next` returns `None` once nothing is
    /// pending or in flight.
    pub fn close(&self) {
        self.shared.state().closed = true;
        self.shared.notify.notify_waiters();
    }

    pub fn pending_len(&self) -> usize {
        self.shared.state().pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.shared.state().in_flight.len()
    }

    /// Highest number of simultaneously unsettled deliveries observed
    pub fn peak_in_flight(&self) -> usize {
        self.shared.state().peak_in_flight
    }

    /// Payloads acknowledged so far, in ack order
    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.shared.state().acked.clone()
    }

    pub fn redeliveries(&self) -> usize {
        self.shared.state().redeliveries
    }

    fn settle(&self, id: u64, requeue: bool) -> Result<(), QueueError> {
        {
            let mut state = self.shared.state();
            let message = state
                .in_flight
                .remove(&id)
                .ok_or_else(|| QueueError::UnknownDelivery(format!("memory#{}", id)))?;

            if requeue {
                state.redeliveries += 1;
                state.pending.push_back(message);
            } else {
                state.acked.push(message.payload);
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl InboundQueue for MemoryQueue {
    type Delivery = MemoryDelivery;

    async fn next(&self) -> Option<Result<MemoryDelivery, QueueError>> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state();
                if let Some(mut message) = state.pending.pop_front() {
                    message.deliveries += 1;
                    let delivery = MemoryDelivery {
                        queue: self.clone(),
                        id: message.id,
                        payload: message.payload.clone(),
                        attempt: message.deliveries,
                    };
                    state.in_flight.insert(message.id, message);
                    state.peak_in_flight = state.peak_in_flight.max(state.in_flight.len());
                    return Some(Ok(delivery));
                }
                if state.closed && state.in_flight.is_empty() {
                    return None;
                }
            }
            notified.await;
        }
    }
}

pub struct MemoryDelivery {
    queue: MemoryQueue,
    id: u64,
    payload: Vec<u8>,
    attempt: u32,
}

impl MemoryDelivery {
    /// 1 on first delivery
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn tag(&self) -> String {
        format!("memory#{}/{}", self.id, self.attempt)
    }

    async fn ack(&self) -> Result<(), QueueError> {
        self.queue.settle(self.id, false)
    }

    async fn requeue(&self) -> Result<(), QueueError> {
        self.queue.settle(self.id, true)
    }
}
