use serde::{Deserialize, Serialize};

pub const MAPPING_KEY_PREFIX: &str = "api_key:";

/// Durable fact "this hashed credential belongs to this subject"
///
/// Consumed downstream and written to the key/value store as `key -> value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecord {
    pub key: String,
    pub value: String,
}

impl MappingRecord {
    pub fn new(stored_hash: &str, subject_id: &str) -> Self {
        Self {
            key: format!("{}{}", MAPPING_KEY_PREFIX, stored_hash),
            value: subject_id.to_string(),
        }
    }

    pub fn subject_id(&self) -> &str {
        &self.value
    }
}
