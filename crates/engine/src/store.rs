//! Adapters that put a `Storage` behind the pipeline's async seams.

use std::sync::Arc;

use tandem_core::{EntityKey, EntityState, Operation, OperationKind};
use tandem_storage::{EntityRecord, Storage, StorageError};
use tokio::sync::Mutex;

use crate::error::{EngineError, ExecutionError};
use crate::queue::{ExecutionFuture, OperationExecutor};
use crate::validator::{Snapshot, SnapshotFuture, SnapshotSource};

/// Shared, task-safe access to an authoritative store.
pub struct StoreHandle<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for StoreHandle<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Storage + Send + 'static> StoreHandle<S> {
    pub fn new(storage: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(storage)),
        }
    }

    pub async fn get(&self, key: &EntityKey) -> Result<Option<EntityState>, StorageError> {
        Ok(self.inner.lock().await.get_entity(key)?.map(|record| record.state))
    }

    pub async fn set(&self, key: &EntityKey, state: &EntityState) -> Result<EntityRecord, StorageError> {
        self.inner.lock().await.put_entity(key, state)
    }

    pub async fn delete(&self, key: &EntityKey) -> Result<bool, StorageError> {
        self.inner.lock().await.delete_entity(key)
    }

    pub async fn snapshot(&self) -> Result<Snapshot, StorageError> {
        self.inner.lock().await.snapshot()
    }

    /// Run `f` with exclusive access, e.g. to simulate an out-of-band write.
    pub async fn with<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut *self.inner.lock().await)
    }

    /// Apply one operation. Deleting an absent entity counts as success.
    pub async fn apply(&self, operation: &Operation) -> Result<bool, ExecutionError> {
        let mut storage = self.inner.lock().await;
        match (operation.kind, &operation.payload) {
            (OperationKind::Delete, _) => {
                storage.delete_entity(&operation.entity)?;
            }
            (OperationKind::Add | OperationKind::Update, Some(payload)) => {
                storage.put_entity(&operation.entity, payload)?;
            }
            (kind, None) => {
                return Err(ExecutionError::Failed(format!(
                    "{} on {} carries no payload",
                    kind.as_str(),
                    operation.entity
                )));
            }
        }
        Ok(true)
    }
}

impl<S: Storage + Send + 'static> SnapshotSource for StoreHandle<S> {
    fn fetch_snapshot(&self) -> SnapshotFuture {
        let handle = self.clone();
        Box::pin(async move { handle.snapshot().await.map_err(EngineError::from) })
    }
}

/// Executes operations directly against a `StoreHandle`.
pub struct StorageExecutor<S> {
    store: StoreHandle<S>,
}

impl<S: Storage + Send + 'static> StorageExecutor<S> {
    pub fn new(store: StoreHandle<S>) -> Self {
        Self { store }
    }
}

impl<S: Storage + Send + 'static> OperationExecutor for StorageExecutor<S> {
    fn execute(&self, operation: Operation) -> ExecutionFuture {
        let store = self.store.clone();
        Box::pin(async move { store.apply(&operation).await })
    }
}
