//! Domain model: task records, identifiers, batch outcomes, errors.

pub mod errors;
pub mod ids;
pub mod outcome;
pub mod state;
pub mod task;

pub use errors::{HandlerError, StoreError};
pub use ids::TaskId;
pub use outcome::{BatchOutcome, BatchResult, SharedOutcome};
pub use state::CoordinatorState;
pub use task::{NewTask, TaskRecord, TaskType};
