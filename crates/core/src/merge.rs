//! Combining a new intent with the live operation already tracked for the same
//! entity. Pure functions only; the update manager applies the outcome.

use crate::operations::{Intent, Operation, OperationKind};
use crate::state::EntityState;

/// The record that replaces the existing one after a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedIntent {
    pub kind: OperationKind,
    pub payload: Option<EntityState>,
    pub original_payload: Option<EntityState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Supersede the existing record with a new one.
    Replace(MergedIntent),
    /// The existing record already covers the incoming intent.
    Absorbed,
    /// Existing and incoming cancel out; nothing reaches the store.
    Cancelled,
    Rejected(String),
}

/// Decide how `incoming` combines with `existing`.
///
/// `existing_in_flight` means the existing record's write is already on its
/// way to the store, so the result must be expressed relative to the state
/// that write produces rather than folded into it.
pub fn merge_policy(existing: &Operation, incoming: &Intent, existing_in_flight: bool) -> MergeOutcome {
    use OperationKind::{Add, Delete, Update};

    let original = existing.original_payload.clone();
    let replace = |kind: OperationKind| {
        MergeOutcome::Replace(MergedIntent {
            kind,
            payload: match kind {
                Delete => None,
                Add | Update => incoming.payload.clone(),
            },
            original_payload: original.clone(),
        })
    };

    match (existing.kind, incoming.kind, existing_in_flight) {
        (Add, Add | Update, false) => replace(Add),
        (Add, Delete, false) => MergeOutcome::Cancelled,
        (Update, Add | Update, false) => replace(Update),
        (Add | Update, Add | Update, true) => replace(Update),
        (Add | Update, Delete, _) => replace(Delete),
        // The entity id is reused: re-adding over a pending delete becomes an update
        (Delete, Add, false) => replace(Update),
        (Delete, Add, true) => replace(Add),
        (Delete, Update, _) => MergeOutcome::Rejected(format!(
            "{} is pending deletion; submit an add to recreate it",
            existing.entity
        )),
        (Delete, Delete, _) => MergeOutcome::Absorbed,
    }
}

/// Re-derive a follow-up record's kind after the in-flight record it was
/// built on top of failed. `None` means the follow-up has nothing left to do.
pub fn rebase_on_failure(superseded: OperationKind, follow_up: OperationKind) -> Option<OperationKind> {
    use OperationKind::{Add, Delete, Update};

    match (superseded, follow_up) {
        (Add, Update) => Some(Add),
        (Add, Delete) => None,
        (Delete, Add) => Some(Update),
        (_, kind) => Some(kind),
    }
}
