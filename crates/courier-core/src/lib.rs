//! courier-core
//!
//! Background task scheduling and dispatch engine.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, outcome, state, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, Clock, IdGenerator）
//! - **typed**: 型付き Task API（Task trait, Handler trait, TypedRegistry, PayloadCodec）
//! - **app**: コーディネータ、ディスパッチャ、builder
//! - **impls**: 実装（InMemoryTaskStore, SqliteTaskStore, RetryingTaskStore）
//! - **config**: EngineConfig（TOML）

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;

pub use app::{BackgroundTaskManager, BuildError, ManagerHandle, SchedulerBuilder, TaskNotifier};
pub use config::{DispatcherOptions, EngineConfig, QuarantinePolicy};
pub use domain::{HandlerError, NewTask, StoreError, TaskId, TaskRecord, TaskType};
pub use ports::TaskStore;
pub use typed::{Envelope, Handler, Task};
