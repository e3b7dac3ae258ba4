use std::time::Duration;

use tandem_core::CoreError;
use tandem_storage::StorageError;
use thiserror::Error;

/// Why a single executor attempt did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("executor reported failure")]
    Rejected,

    #[error("executor failed: {0}")]
    Failed(String),

    #[error("executor timed out after {0:?}")]
    TimedOut(Duration),

    #[error("executor panicked: {0}")]
    Panicked(String),
}

impl From<StorageError> for ExecutionError {
    fn from(e: StorageError) -> Self {
        ExecutionError::Failed(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid intent: {0}")]
    Validation(String),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("no operation executor configured")]
    ExecutorNotConfigured,

    #[error("no tokio runtime available")]
    NoRuntime,

    #[error("a consistency validation is already running")]
    ValidationInProgress,

    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: ExecutionError },
}

impl EngineError {
    pub(crate) fn from_core_validation(e: CoreError) -> Self {
        match e {
            CoreError::InvalidIntent(msg) => EngineError::Validation(msg),
            other => EngineError::Core(other),
        }
    }
}
