//! SchedulerBuilder - 登録とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 登録表は build() 後に不変

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use super::coordinator::BackgroundTaskManager;
use super::handle::ManagerHandle;
use super::notifier::TaskNotifier;
use crate::config::{ConfigError, DispatcherOptions, EngineConfig};
use crate::domain::TaskType;
use crate::impls::RetryingTaskStore;
use crate::ports::{Clock, SystemClock, TaskStore};
use crate::typed::{Handler, RegistryError, Task, TypedRegistry};

const COMMAND_BUFFER: usize = 32;

/// Collects handler registrations and builds the engine.
///
/// # 使用例
/// ```ignore
/// let (manager, handle) = SchedulerBuilder::new()
///     .register::<SendEmail, _>(EmailHandler, DispatcherOptions::new(2, 20))?
///     .expect_tasks(&[SendEmail::TYPE])
///     .build(store)?;
/// let join = manager.start(cancel.clone());
/// ```
///
/// # Fail-fast 設計
/// - expect_tasks() で期待される task_type を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError を返す
pub struct SchedulerBuilder {
    registry: TypedRegistry,
    expected_tasks: Option<Vec<String>>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    notifier: TaskNotifier,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            registry: TypedRegistry::new(),
            expected_tasks: None,
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            notifier: TaskNotifier::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock for the `wait_until` cut-off of refill queries.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Wakeup signal of the manager being built. Handlers that insert
    /// follow-on tasks are registered before `build()`, so they take it
    /// from here.
    pub fn notifier(&self) -> TaskNotifier {
        self.notifier.clone()
    }

    /// Handler を登録
    ///
    /// # Example
    /// ```ignore
    /// builder.register::<MyTask, _>(MyTaskHandler, DispatcherOptions::new(1, 10))?;
    /// ```
    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
        options: DispatcherOptions,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler, options)?;
        Ok(self)
    }

    /// 期待される task_type のリストを設定
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    /// # 検証
    /// - config の妥当性
    /// - expect_tasks() で設定された task_type が全て登録されているか
    ///
    /// Per-type options from `config.tasks` replace the ones given at
    /// registration. The store is wrapped in a `RetryingTaskStore` using
    /// `config.store_retry`.
    pub fn build(
        mut self,
        store: Arc<dyn TaskStore>,
    ) -> Result<(BackgroundTaskManager, ManagerHandle), BuildError> {
        self.config.validate()?;

        if let Some(expected_tasks) = &self.expected_tasks {
            let registered_types = self.registry.registered_types();
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|x| !registered_types.contains(x))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }

        for (task_type, options) in &self.config.tasks {
            let known = self
                .registry
                .override_options(&TaskType::new(task_type.as_str()), *options)?;
            if !known {
                warn!(task_type = %task_type, "config overrides options of an unregistered task type");
            }
        }

        let store: Arc<dyn TaskStore> = Arc::new(RetryingTaskStore::new(
            store,
            self.config.store_retry.policy(),
        ));
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = ManagerHandle::new(commands_tx, self.notifier.clone());
        let manager = BackgroundTaskManager::new(
            store,
            self.clock,
            self.config,
            self.registry,
            commands_rx,
            self.notifier,
        );
        Ok((manager, handle))
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
