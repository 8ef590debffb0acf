//! TaskStore port: the durable table of pending background tasks.
//!
//! The store is the source of truth. The engine only ever reads eligible
//! rows and deletes finished ones; handlers insert follow-on work through
//! the same trait. Implementations must be safe to call concurrently from
//! the coordinator and from handlers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use crate::domain::{NewTask, StoreError, TaskId, TaskRecord, TaskType};

/// Filter for `TaskStore::query_eligible`.
#[derive(Debug, Clone, PartialEq)]
pub struct EligibleQuery {
    pub exclude_types: HashSet<TaskType>,
    pub exclude_ids: HashSet<TaskId>,
    pub now: DateTime<Utc>,
    pub limit: usize,
}

impl EligibleQuery {
    pub fn new(now: DateTime<Utc>, limit: usize) -> Self {
        Self {
            exclude_types: HashSet::new(),
            exclude_ids: HashSet::new(),
            now,
            limit,
        }
    }

    /// Row-level predicate; ordering and `limit` are applied by the caller.
    pub fn admits(&self, record: &TaskRecord) -> bool {
        record.is_eligible_at(self.now)
            && !self.exclude_types.contains(&record.task_type)
            && !self.exclude_ids.contains(&record.id)
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Up to `limit` tasks that pass `query`, ordered by `wait_until`
    /// ascending (unset first) and then `created` ascending.
    async fn query_eligible(&self, query: &EligibleQuery) -> Result<Vec<TaskRecord>, StoreError>;

    /// Bulk delete. Ids that are already gone are ignored.
    async fn delete_by_ids(&self, ids: &HashSet<TaskId>) -> Result<(), StoreError>;

    async fn insert(&self, task: NewTask) -> Result<TaskRecord, StoreError>;

    /// Delete `done` and insert `followups` in one transaction.
    ///
    /// For handlers that own the deletion of their batch because the
    /// follow-on work must appear atomically with it.
    async fn complete_with_followups(
        &self,
        done: &HashSet<TaskId>,
        followups: Vec<NewTask>,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    async fn count_pending(&self) -> Result<usize, StoreError>;
}

#[async_trait]
impl<S: TaskStore + ?Sized> TaskStore for Arc<S> {
    async fn query_eligible(&self, query: &EligibleQuery) -> Result<Vec<TaskRecord>, StoreError> {
        (**self).query_eligible(query).await
    }

    async fn delete_by_ids(&self, ids: &HashSet<TaskId>) -> Result<(), StoreError> {
        (**self).delete_by_ids(ids).await
    }

    async fn insert(&self, task: NewTask) -> Result<TaskRecord, StoreError> {
        (**self).insert(task).await
    }

    async fn complete_with_followups(
        &self,
        done: &HashSet<TaskId>,
        followups: Vec<NewTask>,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        (**self).complete_with_followups(done, followups).await
    }

    async fn count_pending(&self) -> Result<usize, StoreError> {
        (**self).count_pending().await
    }
}
