//! Error types for the api-key-service pipeline
//!
//! Each component reports its own typed error. `EventProcessor` is the only
//! place these are folded into a `ProcessingOutcome`.

use std::time::Duration;
use thiserror::Error;

/// Credential generation failed
#[derive(Error, Debug)]
pub enum CredentialError {
    /// The secure random source could not produce bytes
    #[error("Entropy unavailable: {0}")]
    EntropyUnavailable(String),
}

/// Mapping record could not be durably published
#[derive(Error, Debug)]
pub enum PublishError {
    /// Broker rejected the record or the producer could not enqueue it
    #[error("Mapping publish rejected by broker: {0}")]
    Rejected(String),

    /// No delivery confirmation within the configured bound
    #[error("Mapping publish not confirmed within {0:?}")]
    Timeout(Duration),

    /// Record could not be encoded
    #[error("Mapping serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Profile service call failed
#[derive(Error, Debug)]
pub enum ForwardError {
    /// Network error, timeout, 5xx or 429
    #[error("Profile service temporarily unavailable: {0}")]
    Retryable(String),

    /// Client-side condition that will not succeed on retry
    #[error("Profile service rejected request ({status}): {message}")]
    Permanent { status: u16, message: String },
}

impl ForwardError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ForwardError::Retryable(_))
    }
}

/// Inbound payload that can never be processed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Malformed event: {0}")]
pub struct MalformedEvent(pub String);

impl MalformedEvent {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Inbound queue transport errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Requeue failed: {0}")]
    Requeue(String),

    #[error("Unknown delivery: {0}")]
    UnknownDelivery(String),
}

/// Configuration loading errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Configuration missing: {0}")]
    Missing(String),

    #[error("Configuration invalid for {var}: {reason}")]
    Invalid { var: String, reason: String },
}
