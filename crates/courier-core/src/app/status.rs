//! Status - コーディネータの状態スナップショット
//!
//! Answers "why is nothing happening for type X": quarantined, at capacity,
//! or simply no eligible rows.

use serde::Serialize;

use crate::domain::{CoordinatorState, TaskType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatcherStatus {
    pub task_type: TaskType,
    pub running_batches: usize,
    pub max_batch_count: usize,
    pub max_tasks_per_batch: usize,
    pub is_full: bool,
    pub quarantined: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerStatus {
    pub state: CoordinatorState,
    /// Claimed by a dispatcher, result not drained yet.
    pub in_flight: usize,
    /// Succeeded, waiting for the next bulk delete.
    pub pending_deletion: usize,
    /// Rows in the store; `None` when the count query failed.
    pub stored: Option<usize>,
    pub quarantined: Vec<TaskType>,
    /// Stored tags with no registered dispatcher.
    pub unroutable: Vec<TaskType>,
    pub dispatchers: Vec<DispatcherStatus>,
}

impl ManagerStatus {
    pub fn dispatcher(&self, task_type: &TaskType) -> Option<&DispatcherStatus> {
        self.dispatchers.iter().find(|d| &d.task_type == task_type)
    }

    pub fn is_quarantined(&self, task_type: &TaskType) -> bool {
        self.quarantined.contains(task_type)
    }
}
