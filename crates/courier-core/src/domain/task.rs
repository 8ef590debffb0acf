use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use super::TaskId;
use crate::typed::{PayloadCodec, Task};

/// Discriminator persisted next to every task; selects the handler and the
/// dispatcher that will process it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn of<T: Task>() -> Self {
        Self::new(T::TYPE)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A unit of deferred work as held by the task store.
///
/// The payload stays untyped here; it is decoded into the concrete `Task`
/// type only once the record reaches the handler registered for its tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_type: TaskType,
    pub created: DateTime<Utc>,
    /// The task must not be dispatched while `now < wait_until`.
    pub wait_until: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
}

impl TaskRecord {
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        self.wait_until.is_none_or(|at| at <= now)
    }

    /// Dispatch order: `wait_until` ascending with unset values first, then
    /// `created` ascending. The id breaks remaining ties so the order is total.
    pub fn dispatch_order(&self, other: &Self) -> Ordering {
        self.wait_until
            .is_some()
            .cmp(&other.wait_until.is_some())
            .then_with(|| self.wait_until.cmp(&other.wait_until))
            .then_with(|| self.created.cmp(&other.created))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Insertion request; the store assigns `id` and `created`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub task_type: TaskType,
    pub wait_until: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
}

impl NewTask {
    pub fn new(task_type: TaskType, payload: serde_json::Value) -> Self {
        Self {
            task_type,
            wait_until: None,
            payload,
        }
    }

    /// Encode a typed payload under its `Task::TYPE` tag.
    pub fn of<T: Task>(task: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(TaskType::of::<T>(), PayloadCodec::encode(task)?))
    }

    pub fn wait_until(mut self, at: DateTime<Utc>) -> Self {
        self.wait_until = Some(at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ulid::Ulid;

    fn record(created_s: i64, wait_until_s: Option<i64>) -> TaskRecord {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        TaskRecord {
            id: TaskId::from_ulid(Ulid::new()),
            task_type: TaskType::new("test"),
            created: base + Duration::seconds(created_s),
            wait_until: wait_until_s.map(|s| base + Duration::seconds(s)),
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn unset_wait_until_sorts_first() {
        let mut records = vec![record(0, Some(5)), record(2, None), record(1, None)];
        records.sort_by(TaskRecord::dispatch_order);
        let created: Vec<_> = records.iter().map(|r| r.created.timestamp() % 60).collect();
        assert_eq!(created, vec![1, 2, 0]);
    }

    #[test]
    fn eligibility_respects_wait_until() {
        let r = record(0, Some(10));
        let base = r.created;
        assert!(!r.is_eligible_at(base + Duration::seconds(9)));
        assert!(r.is_eligible_at(base + Duration::seconds(10)));
        assert!(record(0, None).is_eligible_at(base));
    }

    #[test]
    fn task_type_serializes_as_plain_string() {
        let s = serde_json::to_string(&TaskType::new("email.send.v1")).unwrap();
        assert_eq!(s, "\"email.send.v1\"");
    }
}
