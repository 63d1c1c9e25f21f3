mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use api_key_service::config::ConsumerConfig;
use api_key_service::consumer::{
    handle_delivery, Disposition, InboundQueue, MemoryQueue, QueueConsumer,
};
use common::{direct_event, webhook_user_created, ForwardBehavior, Harness, PublishBehavior};

fn consumer_config(max_in_flight: usize) -> ConsumerConfig {
    ConsumerConfig {
        max_in_flight,
        requeue_delay: Duration::ZERO,
        shutdown_grace: Duration::from_secs(5),
    }
}

async fn run_to_completion(harness: &Harness, queue: &MemoryQueue, max_in_flight: usize) {
    queue.close();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = QueueConsumer::new(
        Arc::new(queue.clone()),
        harness.processor.clone(),
        &consumer_config(max_in_flight),
        shutdown_rx,
    );

    tokio::time::timeout(Duration::from_secs(10), consumer.run())
        .await
        .expect("consumer should stop once the queue drains")
        .unwrap();
}

#[tokio::test]
async fn test_success_is_acked_and_removed() {
    let harness = Harness::new();
    let queue = MemoryQueue::new();
    queue.push(webhook_user_created("user_2abc", "ada@example.com"));

    run_to_completion(&harness, &queue, 1).await;

    assert_eq!(queue.acked().len(), 1);
    assert_eq!(queue.redeliveries(), 0);
    assert_eq!(queue.pending_len(), 0);
    assert_eq!(queue.in_flight_len(), 0);
}

#[tokio::test]
async fn test_retryable_failure_is_requeued_then_acked() {
    let harness = Harness::build(|p| p, |f| f.script([ForwardBehavior::Retryable]));
    let queue = MemoryQueue::new();
    queue.push(webhook_user_created("user_2abc", "ada@example.com"));

    run_to_completion(&harness, &queue, 1).await;

    assert_eq!(queue.redeliveries(), 1);
    assert_eq!(queue.acked().len(), 1);
    assert_eq!(queue.pending_len(), 0);
    assert_eq!(harness.forwarder.calls(), 2);
    // A fresh key and mapping per attempt
    assert_eq!(harness.publisher.calls(), 2);
}

#[tokio::test]
async fn test_publish_failure_requeues_without_forwarding() {
    let harness = Harness::build(|p| p.script([PublishBehavior::Reject]), |f| f);
    let queue = MemoryQueue::new();
    queue.push(webhook_user_created("user_2abc", "ada@example.com"));

    run_to_completion(&harness, &queue, 1).await;

    assert_eq!(queue.redeliveries(), 1);
    assert_eq!(harness.publisher.calls(), 2);
    assert_eq!(harness.forwarder.calls(), 1);
}

#[tokio::test]
async fn test_permanent_failures_and_skips_are_acked() {
    let harness = Harness::build(|p| p, |f| f.script([ForwardBehavior::Permanent(400)]));
    let queue = MemoryQueue::new();
    queue.push(webhook_user_created("user_2abc", "ada@example.com"));
    queue.push(direct_event("session.created", Some("user_2abc"), None));
    queue.push(direct_event("user.created", None, Some("ada@example.com")));
    queue.push("{not json");
    queue.push("[1, 2, 3]");

    run_to_completion(&harness, &queue, 2).await;

    assert_eq!(queue.acked().len(), 5);
    assert_eq!(queue.redeliveries(), 0);
    assert_eq!(queue.pending_len(), 0);
    assert_eq!(queue.in_flight_len(), 0);
    assert_eq!(harness.publisher.calls(), 1);
}

#[tokio::test]
async fn test_in_flight_bounded_by_limit() {
    let harness = Harness::build(|p| p, |f| f.with_delay(Duration::from_millis(30)));
    let queue = MemoryQueue::new();
    for i in 0..10 {
        queue.push(webhook_user_created(
            &format!("user_{}", i),
            &format!("user{}@example.com", i),
        ));
    }

    run_to_completion(&harness, &queue, 3).await;

    assert_eq!(queue.acked().len(), 10);
    assert!(queue.peak_in_flight() <= 3, "peak {}", queue.peak_in_flight());
    assert!(queue.peak_in_flight() > 1, "deliveries never overlapped");
    assert_eq!(harness.forwarder.calls(), 10);
}

#[tokio::test]
async fn test_single_in_flight_processes_in_order() {
    let harness = Harness::new();
    let queue = MemoryQueue::new();
    for subject in ["user_a", "user_b", "user_c"] {
        queue.push(webhook_user_created(subject, "someone@example.com"));
    }

    run_to_completion(&harness, &queue, 1).await;

    assert_eq!(queue.peak_in_flight(), 1);
    let subjects: Vec<String> = harness
        .forwarder
        .forwarded()
        .into_iter()
        .map(|call| call.subject_id)
        .collect();
    assert_eq!(subjects, vec!["user_a", "user_b", "user_c"]);
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_and_stops_pulling() {
    let harness = Harness::build(|p| p, |f| f.with_delay(Duration::from_millis(100)));
    let queue = MemoryQueue::new();
    queue.push(webhook_user_created("user_a", "a@example.com"));
    queue.push(webhook_user_created("user_b", "b@example.com"));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = QueueConsumer::new(
        Arc::new(queue.clone()),
        harness.processor.clone(),
        &consumer_config(1),
        shutdown_rx,
    );
    let handle = tokio::spawn(consumer.run());

    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("consumer should stop after draining")
        .unwrap()
        .unwrap();

    assert_eq!(queue.acked().len(), 1);
    assert_eq!(queue.pending_len(), 1);
    assert_eq!(queue.in_flight_len(), 0);
}

#[tokio::test]
async fn test_grace_period_abandons_stuck_delivery() {
    let harness = Harness::build(|p| p, |f| f.with_delay(Duration::from_secs(30)));
    let queue = MemoryQueue::new();
    queue.push(webhook_user_created("user_a", "a@example.com"));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let config = ConsumerConfig {
        shutdown_grace: Duration::from_millis(50),
        ..consumer_config(1)
    };
    let consumer = QueueConsumer::new(
        Arc::new(queue.clone()),
        harness.processor.clone(),
        &config,
        shutdown_rx,
    );
    let handle = tokio::spawn(consumer.run());

    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("consumer should give up after the grace period")
        .unwrap()
        .unwrap();

    // Never settled, so a real broker would redeliver it
    assert!(queue.acked().is_empty());
    assert_eq!(queue.in_flight_len(), 1);
}

#[tokio::test]
async fn test_handle_delivery_dispositions() {
    let harness = Harness::build(|p| p, |f| f.script([ForwardBehavior::Retryable]));
    let queue = MemoryQueue::new();
    queue.push(webhook_user_created("user_a", "a@example.com"));
    queue.push("not an event");

    let first = queue.next().await.unwrap().unwrap();
    assert_eq!(
        handle_delivery(&harness.processor, &first).await,
        Disposition::Requeue
    );

    let second = queue.next().await.unwrap().unwrap();
    assert_eq!(
        handle_delivery(&harness.processor, &second).await,
        Disposition::Ack
    );

    assert_eq!(queue.pending_len(), 1);
    assert_eq!(queue.acked(), vec![b"not an event".to_vec()]);
}
