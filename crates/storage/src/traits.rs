use std::collections::BTreeMap;

use tandem_core::{hlc::Hlc, ids::EntityKey, state::EntityState};

use crate::error::StorageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    pub key: EntityKey,
    pub state: EntityState,
    pub digest: [u8; 32],
    pub updated_at: Hlc,
}

/// Authoritative entity store. Any non-success outcome is an `Err`; a write
/// either lands completely or not at all.
pub trait Storage {
    fn get_entity(&self, key: &EntityKey) -> Result<Option<EntityRecord>, StorageError>;

    fn put_entity(&mut self, key: &EntityKey, state: &EntityState) -> Result<EntityRecord, StorageError>;

    /// Returns whether a record was removed.
    fn delete_entity(&mut self, key: &EntityKey) -> Result<bool, StorageError>;

    fn snapshot(&self) -> Result<BTreeMap<EntityKey, EntityState>, StorageError>;

    fn entity_count(&self) -> Result<u64, StorageError>;
}
