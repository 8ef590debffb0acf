//! In-memory task store for tests and local runs.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::domain::{NewTask, StoreError, TaskId, TaskRecord};
use crate::ports::{Clock, EligibleQuery, IdGenerator, SystemClock, TaskStore, UlidGenerator};

/// Task store kept in a mutex-guarded map.
///
/// Every method takes the lock once and never holds it across an await, so
/// multi-row operations are atomic in the same way a database transaction
/// would be.
pub struct InMemoryTaskStore {
    rows: Mutex<BTreeMap<TaskId, TaskRecord>>,
    clock: Arc<dyn Clock>,
    ids: Box<dyn IdGenerator>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            ids: Box::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
        }
    }

    fn rows(&self) -> Result<MutexGuard<'_, BTreeMap<TaskId, TaskRecord>>, StoreError> {
        self.rows
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".into()))
    }

    fn materialize(&self, task: NewTask) -> TaskRecord {
        TaskRecord {
            id: self.ids.generate_task_id(),
            task_type: task.task_type,
            created: self.clock.now(),
            wait_until: task.wait_until,
            payload: task.payload,
        }
    }

    /// All stored rows in dispatch order.
    pub fn snapshot(&self) -> Vec<TaskRecord> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<TaskRecord> = rows.values().cloned().collect();
        all.sort_by(TaskRecord::dispatch_order);
        all
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        rows.contains_key(id)
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn query_eligible(&self, query: &EligibleQuery) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = self.rows()?;
        let mut eligible: Vec<TaskRecord> = rows
            .values()
            .filter(|record| query.admits(record))
            .cloned()
            .collect();
        eligible.sort_by(TaskRecord::dispatch_order);
        eligible.truncate(query.limit);
        Ok(eligible)
    }

    async fn delete_by_ids(&self, ids: &HashSet<TaskId>) -> Result<(), StoreError> {
        let mut rows = self.rows()?;
        for id in ids {
            rows.remove(id);
        }
        Ok(())
    }

    async fn insert(&self, task: NewTask) -> Result<TaskRecord, StoreError> {
        let record = self.materialize(task);
        self.rows()?.insert(record.id, record.clone());
        Ok(record)
    }

    async fn complete_with_followups(
        &self,
        done: &HashSet<TaskId>,
        followups: Vec<NewTask>,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let records: Vec<TaskRecord> = followups
            .into_iter()
            .map(|task| self.materialize(task))
            .collect();
        let mut rows = self.rows()?;
        for id in done {
            rows.remove(id);
        }
        for record in &records {
            rows.insert(record.id, record.clone());
        }
        Ok(records)
    }

    async fn count_pending(&self) -> Result<usize, StoreError> {
        Ok(self.rows()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskType;
    use crate::ports::FixedClock;
    use chrono::{Duration, TimeZone, Utc};

    #[tokio::test]
    async fn insert_stamps_id_and_created() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let store = InMemoryTaskStore::with_clock(Arc::new(FixedClock::new(t0)));

        let record = store
            .insert(NewTask::new(TaskType::new("a"), serde_json::json!({ "n": 1 })))
            .await
            .unwrap();

        assert_eq!(record.created, t0);
        assert_eq!(record.id.as_ulid().timestamp_ms(), t0.timestamp_millis() as u64);
        assert!(store.contains(&record.id));
        assert_eq!(store.count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn followups_replace_done_tasks() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let store = InMemoryTaskStore::with_clock(Arc::new(clock.clone()));
        let parent = store
            .insert(NewTask::new(TaskType::new("fanout"), serde_json::json!({})))
            .await
            .unwrap();
        clock.advance(Duration::milliseconds(1));

        let inserted = store
            .complete_with_followups(
                &HashSet::from([parent.id]),
                vec![
                    NewTask::new(TaskType::new("email"), serde_json::json!({})),
                    NewTask::new(TaskType::new("push"), serde_json::json!({})),
                ],
            )
            .await
            .unwrap();

        assert_eq!(inserted.len(), 2);
        assert!(!store.contains(&parent.id));
        let types: Vec<String> = store
            .snapshot()
            .into_iter()
            .map(|r| r.task_type.to_string())
            .collect();
        assert_eq!(types.len(), 2);
        assert!(types.contains(&"email".to_string()));
    }
}
