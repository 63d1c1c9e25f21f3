//! Profile service client
//!
//! Sends the new user's profile together with their freshly minted API key.
//! This is the only call that carries the rendered key out of the process.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::ProfileServiceConfig;
use crate::error::ForwardError;
use crate::metrics;
use crate::models::ProfileData;
use crate::services::credential::{Credential, API_KEY_PREFIX};

pub const PROFILE_ENDPOINT_PATH: &str = "/api/profiles/me";
pub const API_KEY_HEADER: &str = "x-api-key";

const REDACTED: &str = "<redacted>";

/// Outbound channel to the profile service
#[async_trait]
pub trait ProfileForwarder: Send + Sync {
    async fn forward(
        &self,
        subject_id: &str,
        profile: &ProfileData,
        credential: &Credential,
    ) -> Result<(), ForwardError>;
}

/// Request body expected by the profile service
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProfileRequest<'a> {
    clerk_id: &'a str,
    email: Option<&'a str>,
    email_verified: bool,
    phone_number: Option<&'a str>,
    phone_verified: bool,
    first_name: Option<&'a str>,
    last_name: Option<&'a str>,
    avatar_url: Option<&'a str>,
    api_key: &'a str,
}

impl<'a> ProfileRequest<'a> {
    fn new(subject_id: &'a str, profile: &'a ProfileData, credential: &'a Credential) -> Self {
        Self {
            clerk_id: subject_id,
            email: profile.email.as_deref(),
            email_verified: profile.email_verified,
            phone_number: profile.phone_number.as_deref(),
            phone_verified: profile.phone_verified,
            first_name: profile.first_name.as_deref(),
            last_name: profile.last_name.as_deref(),
            avatar_url: profile.avatar_url.as_deref(),
            api_key: credential.expose_token(),
        }
    }
}

/// Map a profile service response status onto the forward contract
///
/// - 2xx: accepted
/// - 5xx and 429: transient, retry via requeue
/// - everything else: the request itself is wrong and will never succeed
pub fn classify_status(status: StatusCode, body: &str) -> Result<(), ForwardError> {
    if status.is_success() {
        return Ok(());
    }

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ForwardError::Retryable(format!(
            "profile service returned {}",
            status
        )));
    }

    Err(ForwardError::Permanent {
        status: status.as_u16(),
        message: truncate(body, 512),
    })
}

/// Strip the rendered key (with or without prefix) from a response body
/// before it reaches an error or a log line
pub fn redact_token(body: &str, token: &str) -> String {
    let secret = token.strip_prefix(API_KEY_PREFIX).unwrap_or(token);
    if secret.is_empty() {
        return body.to_string();
    }
    body.replace(token, REDACTED).replace(secret, REDACTED)
}

fn truncate(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

/// reqwest-backed profile forwarder
pub struct HttpProfileForwarder {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl HttpProfileForwarder {
    /// Build a forwarder with its own pooled client bounded by `config.timeout`
    pub fn from_config(config: &ProfileServiceConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout.min(Duration::from_secs(5)))
            .build()?;
        Ok(Self::new(client, &config.url, &config.api_key))
    }

    pub fn new(client: Client, base_url: &str, api_key: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), PROFILE_ENDPOINT_PATH),
            api_key: api_key.to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ProfileForwarder for HttpProfileForwarder {
    async fn forward(
        &self,
        subject_id: &str,
        profile: &ProfileData,
        credential: &Credential,
    ) -> Result<(), ForwardError> {
        let start = Instant::now();
        debug!(subject_id = %subject_id, endpoint = %self.endpoint, "Sending profile data");

        let response = match self
            .client
            .post(&self.endpoint)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&ProfileRequest::new(subject_id, profile, credential))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                metrics::observe_profile_forward("network_error", start.elapsed());
                let kind = if e.is_timeout() { "timeout" } else { "request failed" };
                // without_url keeps the endpoint out of the error text
                return Err(ForwardError::Retryable(format!(
                    "profile service {}: {}",
                    kind,
                    e.without_url()
                )));
            }
        };

        let status = response.status();
        let body = if status.is_success() {
            String::new()
        } else {
            redact_token(
                &response.text().await.unwrap_or_default(),
                credential.expose_token(),
            )
        };

        let result = classify_status(status, &body);
        let label = match &result {
            Ok(()) => "success",
            Err(ForwardError::Retryable(_)) => "retryable",
            Err(ForwardError::Permanent { .. }) => "permanent",
        };
        metrics::observe_profile_forward(label, start.elapsed());

        if result.is_ok() {
            info!(
                subject_id = %subject_id,
                status = status.as_u16(),
                has_email = profile.email.is_some(),
                has_phone = profile.phone_number.is_some(),
                has_name = profile.has_name(),
                "Profile created"
            );
        }

        result
    }
}
