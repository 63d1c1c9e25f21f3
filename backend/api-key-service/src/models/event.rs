//! Inbound identity-provider events
//!
//! Two wire shapes are accepted on the webhook topic:
//!
//! ```json
//! {"eventType": "user.created",
//!  "data": {"type": "user.created", "data": {"id": "user_2x...", ...}}}
//! ```
//!
//! as relayed from the identity provider's webhook, and the flattened form
//!
//! ```json
//! {"type": "user.created", "subject_id": "user_2x...", "profile": {"email": "..."}}
//! ```
//!
//! Both decode into the same strongly typed [`InboundEvent`]. Anything else is a
//! [`MalformedEvent`] and is never retried.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MalformedEvent;

pub const USER_CREATED: &str = "user.created";

/// Prefix of identity-provider user ids
pub const SUBJECT_ID_PREFIX: &str = "user_";

const VERIFIED: &str = "verified";

/// Decoded inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub event_type: String,
    pub subject_id: Option<String>,
    pub profile: ProfileData,
}

/// Profile fields forwarded to the profile service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileData {
    pub email: Option<String>,
    pub email_verified: bool,
    pub phone_number: Option<String>,
    pub phone_verified: bool,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl ProfileData {
    pub fn has_contact(&self) -> bool {
        non_empty(&self.email) || non_empty(&self.phone_number)
    }

    pub fn has_name(&self) -> bool {
        non_empty(&self.first_name) || non_empty(&self.last_name)
    }
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

impl InboundEvent {
    pub fn is_user_created(&self) -> bool {
        self.event_type == USER_CREATED
    }

    /// Decode a raw queue payload
    pub fn from_slice(payload: &[u8]) -> Result<Self, MalformedEvent> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| MalformedEvent::new(format!("invalid JSON: {}", e)))?;

        let Value::Object(ref fields) = value else {
            return Err(MalformedEvent::new("payload is not a JSON object"));
        };

        if fields.contains_key("eventType") || fields.contains_key("data") {
            let message: WebhookMessage = serde_json::from_value(value)
                .map_err(|e| MalformedEvent::new(format!("invalid webhook envelope: {}", e)))?;
            return message.into_event();
        }

        if fields.contains_key("type") {
            let direct: DirectEvent = serde_json::from_value(value)
                .map_err(|e| MalformedEvent::new(format!("invalid event: {}", e)))?;
            return Ok(InboundEvent {
                event_type: direct.event_type,
                subject_id: direct.subject_id,
                profile: direct.profile,
            });
        }

        Err(MalformedEvent::new("missing event type"))
    }
}

#[derive(Debug, Deserialize)]
struct DirectEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    subject_id: Option<String>,
    #[serde(default)]
    profile: ProfileData,
}

#[derive(Debug, Deserialize)]
struct WebhookMessage {
    #[serde(rename = "eventType", default)]
    event_type: Option<String>,
    #[serde(default)]
    data: Option<WebhookData>,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    #[serde(rename = "type", default)]
    event_type: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

impl WebhookMessage {
    fn into_event(self) -> Result<InboundEvent, MalformedEvent> {
        let inner_type = self.data.as_ref().and_then(|d| d.event_type.clone());

        let event_type = match (self.event_type, inner_type) {
            (Some(outer), Some(inner)) if outer != inner => {
                return Err(MalformedEvent::new(format!(
                    "event type mismatch: envelope={} data={}",
                    outer, inner
                )));
            }
            (Some(outer), _) => outer,
            (None, Some(inner)) => inner,
            (None, None) => return Err(MalformedEvent::new("missing event type")),
        };

        if event_type != USER_CREATED {
            return Ok(InboundEvent {
                event_type,
                subject_id: None,
                profile: ProfileData::default(),
            });
        }

        let user_value = self
            .data
            .and_then(|d| d.data)
            .ok_or_else(|| MalformedEvent::new("user.created event without user data"))?;

        let user: WebhookUser = serde_json::from_value(user_value)
            .map_err(|e| MalformedEvent::new(format!("invalid user data: {}", e)))?;

        Ok(user.into_event(event_type))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WebhookUser {
    id: Option<String>,
    email_addresses: Vec<EmailAddress>,
    primary_email_address_id: Option<String>,
    phone_numbers: Vec<PhoneNumber>,
    primary_phone_number_id: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    image_url: Option<String>,
    profile_image_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EmailAddress {
    id: Option<String>,
    email_address: Option<String>,
    verification: Option<Verification>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PhoneNumber {
    id: Option<String>,
    phone_number: Option<String>,
    verification: Option<Verification>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Verification {
    status: Option<String>,
}

fn is_verified(verification: &Option<Verification>) -> bool {
    verification
        .as_ref()
        .and_then(|v| v.status.as_deref())
        .is_some_and(|status| status == VERIFIED)
}

/// Entry whose id matches `primary_id`, else the first entry
fn select_primary<'a, T>(
    entries: &'a [T],
    primary_id: Option<&str>,
    id_of: impl Fn(&T) -> Option<&str>,
) -> Option<&'a T> {
    primary_id
        .and_then(|primary| entries.iter().find(|e| id_of(e) == Some(primary)))
        .or_else(|| entries.first())
}

impl WebhookUser {
    fn into_event(self, event_type: String) -> InboundEvent {
        let email = select_primary(
            &self.email_addresses,
            self.primary_email_address_id.as_deref(),
            |e| e.id.as_deref(),
        );
        let phone = select_primary(
            &self.phone_numbers,
            self.primary_phone_number_id.as_deref(),
            |p| p.id.as_deref(),
        );

        let profile = ProfileData {
            email: email.and_then(|e| e.email_address.clone()),
            email_verified: email.is_some_and(|e| is_verified(&e.verification)),
            phone_number: phone.and_then(|p| p.phone_number.clone()),
            phone_verified: phone.is_some_and(|p| is_verified(&p.verification)),
            first_name: self.first_name,
            last_name: self.last_name,
            avatar_url: self
                .image_url
                .filter(|url| !url.is_empty())
                .or(self.profile_image_url),
        };

        InboundEvent {
            event_type,
            subject_id: self.id,
            profile,
        }
    }
}
