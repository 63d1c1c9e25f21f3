pub mod event;
pub mod mapping;

pub use event::{InboundEvent, ProfileData, SUBJECT_ID_PREFIX, USER_CREATED};
pub use mapping::{MappingRecord, MAPPING_KEY_PREFIX};
