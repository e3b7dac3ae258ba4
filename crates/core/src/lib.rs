pub mod error;
pub mod field_value;
pub mod hlc;
pub mod ids;
pub mod merge;
pub mod operations;
pub mod state;

pub use error::CoreError;
pub use field_value::FieldValue;
pub use hlc::{Hlc, HlcClock};
pub use ids::*;
pub use merge::{merge_policy, rebase_on_failure, MergeOutcome, MergedIntent};
pub use operations::{Intent, Operation, OperationKind, OperationStatus};
pub use state::{EntityState, FieldDiff};
