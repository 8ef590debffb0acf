//! App - アプリケーション層
//!
//! ports と typed を組み合わせてエンジン本体を構成します。
//!
//! # 主要コンポーネント
//! - **SchedulerBuilder**: 登録とワイヤリング
//! - **BackgroundTaskManager**: コーディネータ（refill → drain → flush → idle）
//! - **TaskDispatcher**: タスク種別ごとのバッチ実行
//! - **ManagerHandle**: notify / status / reenable / shutdown
//! - **TaskNotifier**: single-slot wakeup

pub mod builder;
pub mod coordinator;
pub mod dispatcher;
pub mod handle;
pub mod notifier;
pub mod status;

pub use self::builder::{BuildError, SchedulerBuilder};
pub use self::coordinator::BackgroundTaskManager;
pub use self::dispatcher::{DispatcherHandle, TaskDispatcher};
pub use self::handle::{ManagerCommand, ManagerError, ManagerHandle};
pub use self::notifier::TaskNotifier;
pub use self::status::{DispatcherStatus, ManagerStatus};
