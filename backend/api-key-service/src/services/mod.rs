pub mod credential;
pub mod mapping_publisher;
pub mod processor;
pub mod profile_forwarder;

pub use credential::{hash_token, Credential, CredentialGenerator, EntropySource, OsEntropy};
pub use mapping_publisher::{KafkaMappingPublisher, MappingPublisher};
pub use processor::{EventProcessor, ProcessingOutcome, Stage};
pub use profile_forwarder::{HttpProfileForwarder, ProfileForwarder};
