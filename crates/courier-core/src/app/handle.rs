//! ManagerHandle - 実行中のコーディネータへの窓口
//!
//! Cloneable; producers keep one to call `notify()` after committing tasks,
//! operators use it to inspect state or lift a quarantine.

use tokio::sync::{mpsc, oneshot};

use super::notifier::TaskNotifier;
use super::status::ManagerStatus;
use crate::domain::TaskType;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ManagerError {
    #[error("background task manager is not running")]
    NotRunning,
}

/// Requests processed by the coordinator loop between cycles.
#[derive(Debug)]
pub enum ManagerCommand {
    Status {
        response: oneshot::Sender<ManagerStatus>,
    },
    Reenable {
        task_type: TaskType,
        response: oneshot::Sender<bool>,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ManagerHandle {
    commands: mpsc::Sender<ManagerCommand>,
    notifier: TaskNotifier,
}

impl ManagerHandle {
    pub(crate) fn new(commands: mpsc::Sender<ManagerCommand>, notifier: TaskNotifier) -> Self {
        Self { commands, notifier }
    }

    /// New tasks were committed; wake the coordinator. Never blocks and
    /// works before the manager is started.
    pub fn notify(&self) {
        self.notifier.notify();
    }

    pub fn notifier(&self) -> TaskNotifier {
        self.notifier.clone()
    }

    pub async fn status(&self) -> Result<ManagerStatus, ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ManagerCommand::Status { response: tx })
            .await
            .map_err(|_| ManagerError::NotRunning)?;
        rx.await.map_err(|_| ManagerError::NotRunning)
    }

    /// Lift the quarantine of `task_type`. Returns whether it was
    /// quarantined.
    pub async fn reenable(&self, task_type: &TaskType) -> Result<bool, ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ManagerCommand::Reenable {
                task_type: task_type.clone(),
                response: tx,
            })
            .await
            .map_err(|_| ManagerError::NotRunning)?;
        rx.await.map_err(|_| ManagerError::NotRunning)
    }

    /// Ask the manager to stop claiming work and finish gracefully.
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        self.commands
            .send(ManagerCommand::Shutdown)
            .await
            .map_err(|_| ManagerError::NotRunning)
    }
}
