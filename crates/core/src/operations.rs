use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::hlc::Hlc;
use crate::ids::{EntityKey, OpId};
use crate::state::EntityState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Add,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationStatus {
    Pending,
    Retrying,
    Confirmed,
    Failed,
    /// Superseded by a later intent on the same entity; kept for audit only.
    Merged,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Merged => "merged",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }

    /// Terminal or merged: no further execution will happen for this record.
    pub fn is_settled(&self) -> bool {
        !self.is_active()
    }
}

/// A mutation request as issued by the UI, before it becomes a tracked record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    pub kind: OperationKind,
    pub entity: EntityKey,
    pub payload: Option<EntityState>,
    pub original_payload: Option<EntityState>,
}

impl Intent {
    pub fn add(entity: EntityKey, payload: EntityState) -> Self {
        Self {
            kind: OperationKind::Add,
            entity,
            payload: Some(payload),
            original_payload: None,
        }
    }

    pub fn update(entity: EntityKey, payload: EntityState, original: Option<EntityState>) -> Self {
        Self {
            kind: OperationKind::Update,
            entity,
            payload: Some(payload),
            original_payload: original,
        }
    }

    pub fn delete(entity: EntityKey, original: Option<EntityState>) -> Self {
        Self {
            kind: OperationKind::Delete,
            entity,
            payload: None,
            original_payload: original,
        }
    }

    /// Structural checks only; payload contents are the caller's business.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.entity.id.as_str().trim().is_empty() {
            return Err(CoreError::InvalidIntent("entity id must not be empty".into()));
        }
        match self.kind {
            OperationKind::Add | OperationKind::Update if self.payload.is_none() => {
                Err(CoreError::InvalidIntent(format!(
                    "{} on {} requires a payload",
                    self.kind.as_str(),
                    self.entity
                )))
            }
            _ => Ok(()),
        }
    }
}

/// One tracked mutation against one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    pub kind: OperationKind,
    pub entity: EntityKey,
    pub payload: Option<EntityState>,
    /// Pre-chain snapshot used for rollback; `None` when the chain started with an add.
    pub original_payload: Option<EntityState>,
    pub status: OperationStatus,
    pub created_at: Hlc,
    pub updated_at: Hlc,
    pub last_attempt_at: Option<Hlc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub superseded_by: Option<OpId>,
}

impl Operation {
    pub fn from_intent(intent: Intent, now: Hlc) -> Self {
        Self {
            id: OpId::new(),
            kind: intent.kind,
            entity: intent.entity,
            payload: intent.payload,
            original_payload: intent.original_payload,
            status: OperationStatus::Pending,
            created_at: now,
            updated_at: now,
            last_attempt_at: None,
            attempts: 0,
            last_error: None,
            superseded_by: None,
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}
