use tandem_core::{EntityKey, EntityState};
use tandem_engine::{
    DataConsistencyValidator, OptimisticUpdateManager, PipelineConfig, StoreHandle, ValidatorConfig,
};
use tandem_storage::{SqliteStorage, StorageError};

use crate::ScriptedExecutor;

/// An update manager wired to a scripted executor over an in-memory store.
/// Must be built inside a tokio runtime.
pub struct TestPipeline {
    pub manager: OptimisticUpdateManager,
    pub executor: ScriptedExecutor,
    pub store: StoreHandle<SqliteStorage>,
}

impl TestPipeline {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Self::with_config(PipelineConfig::default())
    }

    pub fn with_config(config: PipelineConfig) -> Result<Self, Box<dyn std::error::Error>> {
        Self::with_storage(config, SqliteStorage::open_in_memory()?)
    }

    pub fn with_storage(
        config: PipelineConfig,
        storage: SqliteStorage,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let store = StoreHandle::new(storage);
        let executor = ScriptedExecutor::new(store.clone());
        let manager = OptimisticUpdateManager::new(config)?;
        manager.set_operation_executor(executor.clone());
        Ok(Self {
            manager,
            executor,
            store,
        })
    }

    pub fn validator(&self, config: ValidatorConfig) -> DataConsistencyValidator {
        DataConsistencyValidator::new(self.manager.clone(), self.store.clone(), config)
    }

    /// Write `state` to the store and hydrate the manager's confirmed view,
    /// as an initial load would.
    pub async fn seed(&self, key: &EntityKey, state: EntityState) -> Result<(), StorageError> {
        self.store.set(key, &state).await?;
        self.manager.hydrate(key.clone(), state);
        Ok(())
    }

    /// Change the store behind the manager's back.
    pub async fn remote_put(&self, key: &EntityKey, state: &EntityState) -> Result<(), StorageError> {
        self.store.set(key, state).await.map(|_| ())
    }

    pub async fn remote_delete(&self, key: &EntityKey) -> Result<bool, StorageError> {
        self.store.delete(key).await
    }

    pub async fn remote_get(&self, key: &EntityKey) -> Result<Option<EntityState>, StorageError> {
        self.store.get(key).await
    }
}
