//! API key generation
//!
//! Keys are `mk_` followed by 32 bytes from the OS CSPRNG rendered as 64
//! lowercase hex characters. Only the SHA-256 of the rendered key is ever
//! stored; the key itself is handed to the profile service once and dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::CredentialError;
use crate::metrics;

pub const API_KEY_PREFIX: &str = "mk_";

/// Random bytes per key
pub const API_KEY_BYTES: usize = 32;

/// Full rendered length: prefix + hex
pub const API_KEY_LENGTH: usize = API_KEY_PREFIX.len() + API_KEY_BYTES * 2;

const SLOW_GENERATION: Duration = Duration::from_millis(100);

/// Source of cryptographically secure random bytes
pub trait EntropySource: Send + Sync {
    fn fill(&self, dest: &mut [u8]) -> Result<(), CredentialError>;
}

/// Operating system CSPRNG
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, dest: &mut [u8]) -> Result<(), CredentialError> {
        OsRng
            .try_fill_bytes(dest)
            .map_err(|e| CredentialError::EntropyUnavailable(e.to_string()))
    }
}

/// A freshly minted API key and its stored representation
pub struct Credential {
    token: String,
    stored_hash: String,
}

impl Credential {
    /// Rendered key (`mk_<hex>`). Only the profile service may receive this.
    pub fn expose_token(&self) -> &str {
        &self.token
    }

    /// Hex SHA-256 of the rendered key
    pub fn stored_hash(&self) -> &str {
        &self.stored_hash
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("stored_hash", &self.stored_hash)
            .finish()
    }
}

/// Hash a rendered API key for storage and lookup
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct CredentialGenerator {
    entropy: Arc<dyn EntropySource>,
}

impl Default for CredentialGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialGenerator {
    pub fn new() -> Self {
        Self::with_source(Arc::new(OsEntropy))
    }

    pub fn with_source(entropy: Arc<dyn EntropySource>) -> Self {
        Self { entropy }
    }

    pub fn generate(&self) -> Result<Credential, CredentialError> {
        let start = Instant::now();

        let mut bytes = [0u8; API_KEY_BYTES];
        self.entropy.fill(&mut bytes)?;

        let token = format!("{}{}", API_KEY_PREFIX, hex::encode(bytes));
        let stored_hash = hash_token(&token);

        let elapsed = start.elapsed();
        metrics::observe_credential_generation(elapsed);
        debug!(
            generation_time_ms = elapsed.as_secs_f64() * 1000.0,
            "API key generated"
        );
        if elapsed > SLOW_GENERATION {
            warn!(
                generation_time_ms = elapsed.as_secs_f64() * 1000.0,
                "API key generation slow"
            );
        }

        Ok(Credential { token, stored_hash })
    }
}
