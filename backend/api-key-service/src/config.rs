use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct Config {
    pub kafka: KafkaConfig,
    pub profile_service: ProfileServiceConfig,
    pub consumer: ConsumerConfig,
    /// Port for /health and /metrics
    pub http_port: u16,
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    /// Inbound identity-provider webhook events
    pub webhook_topic: String,
    /// Outbound api_key:<hash> -> subject mappings
    pub mapping_topic: String,
    pub group_id: String,
    pub publish_timeout: Duration,
}

#[derive(Clone)]
pub struct ProfileServiceConfig {
    pub url: String,
    pub api_key: String,
    pub timeout: Duration,
}

// api_key must never reach the logs
impl std::fmt::Debug for ProfileServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileServiceConfig")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Maximum unacknowledged messages held at once
    pub max_in_flight: usize,
    pub requeue_delay: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            requeue_delay: Duration::from_millis(1000),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from the process environment (and `.env` if present)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string_or = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let api_key = lookup("PROFILE_SERVICE_API_KEY")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::Missing("PROFILE_SERVICE_API_KEY".to_string()))?;

        let max_in_flight: usize = parse_or(&lookup, "CONSUMER_MAX_IN_FLIGHT", 1)?;
        if max_in_flight == 0 {
            return Err(ConfigError::Invalid {
                var: "CONSUMER_MAX_IN_FLIGHT".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let profile_url = string_or("PROFILE_SERVICE_URL", "http://localhost:8000");
        if !profile_url.starts_with("http://") && !profile_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                var: "PROFILE_SERVICE_URL".to_string(),
                reason: format!("expected http(s) URL, got {}", profile_url),
            });
        }

        Ok(Self {
            kafka: KafkaConfig {
                brokers: string_or("KAFKA_BROKERS", "localhost:9092"),
                webhook_topic: string_or("KAFKA_WEBHOOK_TOPIC", "webhook-events"),
                mapping_topic: string_or("KAFKA_MAPPING_TOPIC", "api-key-mapping"),
                group_id: string_or("KAFKA_GROUP_ID", "api-key-service"),
                publish_timeout: Duration::from_secs(parse_or(
                    &lookup,
                    "MAPPING_PUBLISH_TIMEOUT_SECS",
                    10,
                )?),
            },
            profile_service: ProfileServiceConfig {
                url: profile_url,
                api_key,
                timeout: Duration::from_secs(parse_or(
                    &lookup,
                    "PROFILE_SERVICE_TIMEOUT_SECS",
                    10,
                )?),
            },
            consumer: ConsumerConfig {
                max_in_flight,
                requeue_delay: Duration::from_millis(parse_or(&lookup, "REQUEUE_DELAY_MS", 1000)?),
                shutdown_grace: Duration::from_secs(parse_or(&lookup, "SHUTDOWN_GRACE_SECS", 30)?),
            },
            http_port: parse_or(&lookup, "HTTP_PORT", 8080)?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            var: key.to_string(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}
