use std::collections::HashMap;

use tandem_core::{hlc::Hlc, ids::*, state::EntityState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayValue {
    Present(EntityState),
    /// The entity is optimistically deleted; reads report not-found.
    Removed,
}

impl OverlayValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present(_) => "present",
            Self::Removed => "removed",
        }
    }

    pub fn state(&self) -> Option<&EntityState> {
        match self {
            Self::Present(state) => Some(state),
            Self::Removed => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayEntry {
    pub value: OverlayValue,
    /// Operation whose submission produced this value.
    pub written_by: OpId,
    pub written_at: Hlc,
}

/// Latest optimistic value per entity, read by the UI ahead of confirmation.
#[derive(Debug, Default)]
pub struct Overlay {
    entries: HashMap<EntityKey, OverlayEntry>,
}

impl Overlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &EntityKey) -> Option<&OverlayEntry> {
        self.entries.get(key)
    }

    pub fn put(&mut self, key: EntityKey, state: EntityState, written_by: OpId, written_at: Hlc) {
        self.entries.insert(
            key,
            OverlayEntry {
                value: OverlayValue::Present(state),
                written_by,
                written_at,
            },
        );
    }

    pub fn mark_removed(&mut self, key: EntityKey, written_by: OpId, written_at: Hlc) {
        self.entries.insert(
            key,
            OverlayEntry {
                value: OverlayValue::Removed,
                written_by,
                written_at,
            },
        );
    }

    pub fn remove(&mut self, key: &EntityKey) -> Option<OverlayEntry> {
        self.entries.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_write_wins() {
        let mut overlay = Overlay::new();
        let key = EntityKey::item("X").unwrap();
        let first = OpId::new();
        let second = OpId::new();

        overlay.put(key.clone(), EntityState::new().with_field("rating", 3), first, Hlc::new(1, 0));
        overlay.mark_removed(key.clone(), second, Hlc::new(2, 0));

        let entry = overlay.get(&key).unwrap();
        assert_eq!(entry.value, OverlayValue::Removed);
        assert_eq!(entry.written_by, second);
        assert!(entry.value.state().is_none());

        assert!(overlay.remove(&key).is_some());
        assert!(overlay.is_empty());
    }
}
