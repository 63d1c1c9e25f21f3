//! Test doubles shared by the integration tests
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use api_key_service::error::{CredentialError, ForwardError, PublishError};
use api_key_service::models::{MappingRecord, ProfileData};
use api_key_service::services::credential::CredentialGenerator;
use api_key_service::services::{
    Credential, EntropySource, EventProcessor, MappingPublisher, OsEntropy, ProfileForwarder,
};

/// Cross-component call log used to assert publish-before-forward ordering
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

pub enum PublishBehavior {
    Accept,
    Reject,
    Timeout,
}

/// Mapping publisher that records what it was asked to publish
pub struct RecordingPublisher {
    pub records: Mutex<Vec<MappingRecord>>,
    script: Mutex<VecDeque<PublishBehavior>>,
    log: CallLog,
}

impl RecordingPublisher {
    pub fn new(log: CallLog) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            log,
        }
    }

    /// Queue behaviors for upcoming calls; accepts once the script runs out
    pub fn script(self, behaviors: impl IntoIterator<Item = PublishBehavior>) -> Self {
        self.script.lock().unwrap().extend(behaviors);
        self
    }

    pub fn calls(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn published(&self) -> Vec<MappingRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl MappingPublisher for RecordingPublisher {
    async fn publish(&self, record: &MappingRecord) -> Result<(), PublishError> {
        self.log.push(format!("publish:{}", record.subject_id()));
        self.records.lock().unwrap().push(record.clone());

        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(PublishBehavior::Accept);
        match behavior {
            PublishBehavior::Accept => Ok(()),
            PublishBehavior::Reject => {
                Err(PublishError::Rejected("broker unavailable".to_string()))
            }
            PublishBehavior::Timeout => Err(PublishError::Timeout(Duration::from_secs(10))),
        }
    }
}

pub enum ForwardBehavior {
    Accept,
    Retryable,
    Permanent(u16),
}

#[derive(Debug, Clone)]
pub struct ForwardedCall {
    pub subject_id: String,
    pub profile: ProfileData,
    pub token: String,
}

/// Profile forwarder that records every call, including the rendered key
pub struct RecordingForwarder {
    calls: Mutex<Vec<ForwardedCall>>,
    script: Mutex<VecDeque<ForwardBehavior>>,
    delay: Option<Duration>,
    log: CallLog,
}

impl RecordingForwarder {
    pub fn new(log: CallLog) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            delay: None,
            log,
        }
    }

    pub fn script(self, behaviors: impl IntoIterator<Item = ForwardBehavior>) -> Self {
        self.script.lock().unwrap().extend(behaviors);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn forwarded(&self) -> Vec<ForwardedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProfileForwarder for RecordingForwarder {
    async fn forward(
        &self,
        subject_id: &str,
        profile: &ProfileData,
        credential: &Credential,
    ) -> Result<(), ForwardError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.log.push(format!("forward:{}", subject_id));
        self.calls.lock().unwrap().push(ForwardedCall {
            subject_id: subject_id.to_string(),
            profile: profile.clone(),
            token: credential.expose_token().to_string(),
        });

        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ForwardBehavior::Accept);
        match behavior {
            ForwardBehavior::Accept => Ok(()),
            ForwardBehavior::Retryable => Err(ForwardError::Retryable(
                "profile service returned 503 Service Unavailable".to_string(),
            )),
            ForwardBehavior::Permanent(status) => Err(ForwardError::Permanent {
                status,
                message: "invalid profile".to_string(),
            }),
        }
    }
}

/// OS entropy that counts calls and can be switched off
#[derive(Default)]
pub struct CountingEntropy {
    pub calls: AtomicUsize,
    pub exhausted: std::sync::atomic::AtomicBool,
}

impl EntropySource for CountingEntropy {
    fn fill(&self, dest: &mut [u8]) -> Result<(), CredentialError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.exhausted.load(Ordering::SeqCst) {
            return Err(CredentialError::EntropyUnavailable(
                "entropy source exhausted".to_string(),
            ));
        }
        OsEntropy.fill(dest)
    }
}

pub struct Harness {
    pub processor: EventProcessor,
    pub publisher: Arc<RecordingPublisher>,
    pub forwarder: Arc<RecordingForwarder>,
    pub entropy: Arc<CountingEntropy>,
    pub log: CallLog,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(|p| p, |f| f)
    }

    pub fn build(
        publisher: impl FnOnce(RecordingPublisher) -> RecordingPublisher,
        forwarder: impl FnOnce(RecordingForwarder) -> RecordingForwarder,
    ) -> Self {
        let log = CallLog::default();
        let publisher = Arc::new(publisher(RecordingPublisher::new(log.clone())));
        let forwarder = Arc::new(forwarder(RecordingForwarder::new(log.clone())));
        let entropy = Arc::new(CountingEntropy::default());

        let processor = EventProcessor::new(
            CredentialGenerator::with_source(entropy.clone()),
            publisher.clone(),
            forwarder.clone(),
        );

        Self {
            processor,
            publisher,
            forwarder,
            entropy,
            log,
        }
    }
}

/// Webhook envelope as relayed from the identity provider
pub fn webhook_user_created(subject_id: &str, email: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "eventType": "user.created",
        "data": {
            "type": "user.created",
            "data": {
                "id": subject_id,
                "primary_email_address_id": "idn_1",
                "email_addresses": [
                    {
                        "id": "idn_1",
                        "email_address": email,
                        "verification": {"status": "verified"}
                    }
                ],
                "phone_numbers": [],
                "first_name": "Ada",
                "last_name": "Lovelace",
                "image_url": "https://img.example.com/ada.png"
            }
        }
    }))
    .unwrap()
}

/// Flattened event shape
pub fn direct_event(event_type: &str, subject_id: Option<&str>, email: Option<&str>) -> Vec<u8> {
    let mut event = json!({
        "type": event_type,
        "profile": {"email": email, "email_verified": email.is_some()}
    });
    if let Some(subject_id) = subject_id {
        event["subject_id"] = json!(subject_id);
    }
    serde_json::to_vec(&event).unwrap()
}

/// Captured log output for assertions on what reaches the logs
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    /// Thread-local subscriber writing every level into this buffer
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let buffer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || buffer.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }
}

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
