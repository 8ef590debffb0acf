//! Impls - ports の実装
//!
//! - **InMemoryTaskStore**: tests and local runs
//! - **SqliteTaskStore**: durable store used by the CLI
//! - **RetryingTaskStore**: transient-failure retry around either of them

pub mod memory_store;
pub mod retry;
pub mod retrying_store;
pub mod sqlite_store;

pub use self::memory_store::InMemoryTaskStore;
pub use self::retry::RetryPolicy;
pub use self::retrying_store::RetryingTaskStore;
pub use self::sqlite_store::SqliteTaskStore;
