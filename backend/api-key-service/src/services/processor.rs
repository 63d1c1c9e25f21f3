//! Event processing pipeline
//!
//! For each `user.created` event:
//!
//! ```text
//! validate -> generate key -> publish mapping -> forward profile
//! ```
//!
//! The mapping is always published before the profile is forwarded, so a key
//! handed to the user can always be verified. A failed publish stops the
//! pipeline before the profile service is contacted.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::{ForwardError, MalformedEvent};
use crate::metrics;
use crate::models::{InboundEvent, MappingRecord, SUBJECT_ID_PREFIX};
use crate::services::credential::CredentialGenerator;
use crate::services::mapping_publisher::MappingPublisher;
use crate::services::profile_forwarder::ProfileForwarder;

/// Result of one processing attempt; drives the ack decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Success,
    RetryableFailure(String),
    PermanentFailure(String),
}

impl ProcessingOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessingOutcome::Success)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessingOutcome::RetryableFailure(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, ProcessingOutcome::PermanentFailure(_))
    }

    fn label(&self) -> &'static str {
        match self {
            ProcessingOutcome::Success => "success",
            ProcessingOutcome::RetryableFailure(_) => "retryable",
            ProcessingOutcome::PermanentFailure(_) => "permanent",
        }
    }
}

/// Pipeline stage, used as a log/metric label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validation,
    CredentialGeneration,
    MappingPublish,
    ProfileForward,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validation => "validation",
            Stage::CredentialGeneration => "credential_generation",
            Stage::MappingPublish => "mapping_publish",
            Stage::ProfileForward => "profile_forward",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrates credential issuance for inbound events
#[derive(Clone)]
pub struct EventProcessor {
    generator: CredentialGenerator,
    publisher: Arc<dyn MappingPublisher>,
    forwarder: Arc<dyn ProfileForwarder>,
}

impl EventProcessor {
    pub fn new(
        generator: CredentialGenerator,
        publisher: Arc<dyn MappingPublisher>,
        forwarder: Arc<dyn ProfileForwarder>,
    ) -> Self {
        Self {
            generator,
            publisher,
            forwarder,
        }
    }

    pub async fn process(&self, event: &InboundEvent) -> ProcessingOutcome {
        let outcome = self.run_pipeline(event).await;
        metrics::record_event_outcome(if event.is_user_created() {
            outcome.label()
        } else {
            "skipped"
        });
        outcome
    }

    async fn run_pipeline(&self, event: &InboundEvent) -> ProcessingOutcome {
        if !event.is_user_created() {
            debug!(event_type = %event.event_type, "Skipping non user.created event");
            return ProcessingOutcome::Success;
        }

        let subject_id = match validate(event) {
            Ok(subject_id) => subject_id,
            Err(e) => {
                return permanent(Stage::Validation, event.subject_id.as_deref(), e.to_string());
            }
        };

        info!(
            subject_id = %subject_id,
            has_email = event.profile.email.is_some(),
            has_phone = event.profile.phone_number.is_some(),
            "Processing user.created event"
        );

        let credential = match self.generator.generate() {
            Ok(credential) => credential,
            Err(e) => {
                return retryable(Stage::CredentialGeneration, subject_id, e.to_string());
            }
        };

        let record = MappingRecord::new(credential.stored_hash(), subject_id);
        if let Err(e) = self.publisher.publish(&record).await {
            return retryable(Stage::MappingPublish, subject_id, e.to_string());
        }

        match self
            .forwarder
            .forward(subject_id, &event.profile, &credential)
            .await
        {
            Ok(()) => {
                info!(subject_id = %subject_id, "API key provisioned");
                ProcessingOutcome::Success
            }
            Err(e) => {
                let reason = if e.is_retryable() { "retryable" } else { "permanent" };
                metrics::record_orphaned_mapping(reason);
                // The published mapping now points at a subject whose profile
                // was never created with this key; reconciliation is external.
                warn!(
                    subject_id = %subject_id,
                    mapping_key = %record.key,
                    reason,
                    "Orphaned API key mapping"
                );
                match e {
                    ForwardError::Retryable(msg) => {
                        retryable(Stage::ProfileForward, subject_id, msg)
                    }
                    ForwardError::Permanent { .. } => {
                        permanent(Stage::ProfileForward, Some(subject_id), e.to_string())
                    }
                }
            }
        }
    }
}

/// Check the invariants a `user.created` event must satisfy
pub fn validate(event: &InboundEvent) -> Result<&str, MalformedEvent> {
    let subject_id = event
        .subject_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| MalformedEvent::new("missing subject_id"))?;

    if !subject_id.starts_with(SUBJECT_ID_PREFIX) || subject_id.len() == SUBJECT_ID_PREFIX.len() {
        return Err(MalformedEvent::new(format!(
            "subject_id {} is not a user id",
            subject_id
        )));
    }

    if !event.profile.has_contact() {
        return Err(MalformedEvent::new("profile has neither email nor phone"));
    }

    Ok(subject_id)
}

fn retryable(stage: Stage, subject_id: &str, message: String) -> ProcessingOutcome {
    metrics::record_stage_failure(stage.as_str());
    warn!(
        subject_id = %subject_id,
        stage = %stage,
        error = %message,
        "Event processing failed, will retry"
    );
    ProcessingOutcome::RetryableFailure(format!("{}: {}", stage, message))
}

fn permanent(stage: Stage, subject_id: Option<&str>, message: String) -> ProcessingOutcome {
    metrics::record_stage_failure(stage.as_str());
    error!(
        subject_id = subject_id.unwrap_or("<missing>"),
        stage = %stage,
        error = %message,
        "Event processing failed permanently, dropping"
    );
    ProcessingOutcome::PermanentFailure(format!("{}: {}", stage, message))
}
