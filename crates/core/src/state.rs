use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::CoreError;
use crate::field_value::FieldValue;

/// Full field-level state of one entity, as carried by operation payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityState {
    fields: BTreeMap<String, FieldValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDiff {
    pub field_key: String,
    pub local: Option<FieldValue>,
    pub remote: Option<FieldValue>,
}

impl fmt::Display for FieldDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.local, &self.remote) {
            (Some(local), Some(remote)) => {
                write!(f, "{}: local {:?} vs remote {:?}", self.field_key, local, remote)
            }
            (Some(local), None) => write!(f, "{}: local {:?}, absent remotely", self.field_key, local),
            (None, Some(remote)) => write!(f, "{}: absent locally, remote {:?}", self.field_key, remote),
            (None, None) => write!(f, "{}: absent", self.field_key),
        }
    }
}

impl EntityState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields<K, V>(fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<FieldValue>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    /// Content digest over the canonical (key-ordered) encoding.
    pub fn digest(&self) -> Result<[u8; 32], CoreError> {
        Ok(*blake3::hash(&self.to_msgpack()?).as_bytes())
    }

    /// Field-by-field comparison, `self` taken as the local side.
    pub fn diff(&self, remote: &EntityState) -> Vec<FieldDiff> {
        let mut diffs = Vec::new();
        for (key, local) in &self.fields {
            match remote.fields.get(key) {
                Some(value) if value == local => {}
                other => diffs.push(FieldDiff {
                    field_key: key.clone(),
                    local: Some(local.clone()),
                    remote: other.cloned(),
                }),
            }
        }
        for (key, value) in &remote.fields {
            if !self.fields.contains_key(key) {
                diffs.push(FieldDiff {
                    field_key: key.clone(),
                    local: None,
                    remote: Some(value.clone()),
                });
            }
        }
        diffs.sort_by(|a, b| a.field_key.cmp(&b.field_key));
        diffs
    }
}
