//! API key provisioning worker
//!
//! Consumes identity-provider webhook events, mints an API key for every new
//! user, publishes the hashed key mapping and forwards the user's profile
//! (with the rendered key) to the profile service.

pub mod config;
pub mod consumer;
pub mod error;
pub mod http;
pub mod metrics;
pub mod models;
pub mod services;

pub use config::Config;
pub use consumer::{Delivery, Disposition, InboundQueue, QueueConsumer};
pub use error::{
    ConfigError, CredentialError, ForwardError, MalformedEvent, PublishError, QueueError,
};
pub use services::{EventProcessor, ProcessingOutcome};
