pub mod config;
pub mod error;
pub mod manager;
pub mod overlay;
pub mod queue;
pub mod store;
pub mod validator;

pub use config::{OrphanPolicy, PipelineConfig, ValidatorConfig};
pub use error::{EngineError, ExecutionError};
pub use manager::{OperationEvent, OptimisticUpdateManager, UpdateStats};
pub use overlay::{Overlay, OverlayEntry, OverlayValue};
pub use queue::{
    AttemptOutcome, CleanupReport, Disposition, ExecutionFuture, OperationExecutor, OperationLedger,
    OperationQueueManager, QueueStatus,
};
pub use store::{StorageExecutor, StoreHandle};
pub use validator::{
    ConsistencyReport, DataConsistencyValidator, Divergence, DivergenceKind, Snapshot, SnapshotFuture,
    SnapshotSource, ValidationSchedule, ValidationStats,
};
