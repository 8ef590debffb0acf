//! RetryingTaskStore - wraps any `TaskStore` and retries transient failures.

use async_trait::async_trait;
use std::collections::HashSet;
use std::future::Future;
use tracing::warn;

use super::retry::RetryPolicy;
use crate::domain::{NewTask, StoreError, TaskId, TaskRecord};
use crate::ports::{EligibleQuery, TaskStore};

pub struct RetryingTaskStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: TaskStore> RetryingTaskStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn retry<R, F, Fut>(&self, op: &'static str, mut call: F) -> Result<R, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, StoreError>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && self.policy.allows_retry_after(attempts) => {
                    let delay = self.policy.next_delay(attempts);
                    warn!(
                        op,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "task store call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<S: TaskStore> TaskStore for RetryingTaskStore<S> {
    async fn query_eligible(&self, query: &EligibleQuery) -> Result<Vec<TaskRecord>, StoreError> {
        self.retry("query_eligible", || self.inner.query_eligible(query))
            .await
    }

    async fn delete_by_ids(&self, ids: &HashSet<TaskId>) -> Result<(), StoreError> {
        self.retry("delete_by_ids", || self.inner.delete_by_ids(ids))
            .await
    }

    /// Not retried: a timed-out insert may have landed, and a second try
    /// would mint a second task.
    async fn insert(&self, task: NewTask) -> Result<TaskRecord, StoreError> {
        self.inner.insert(task).await
    }

    /// Not retried, for the same reason as `insert`.
    async fn complete_with_followups(
        &self,
        done: &HashSet<TaskId>,
        followups: Vec<NewTask>,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        self.inner.complete_with_followups(done, followups).await
    }

    async fn count_pending(&self) -> Result<usize, StoreError> {
        self.retry("count_pending", || self.inner.count_pending())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryTaskStore;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails the first `failures` calls to `query_eligible` with `error`.
    struct Flaky {
        inner: InMemoryTaskStore,
        failures: u32,
        calls: AtomicU32,
        transient: bool,
    }

    impl Flaky {
        fn new(failures: u32, transient: bool) -> Self {
            Self {
                inner: InMemoryTaskStore::new(),
                failures,
                calls: AtomicU32::new(0),
                transient,
            }
        }
    }

    #[async_trait]
    impl TaskStore for Flaky {
        async fn query_eligible(&self, query: &EligibleQuery) -> Result<Vec<TaskRecord>, StoreError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(if self.transient {
                    StoreError::Unavailable("database is locked".into())
                } else {
                    StoreError::Corrupt("bad row".into())
                });
            }
            self.inner.query_eligible(query).await
        }

        async fn delete_by_ids(&self, ids: &HashSet<TaskId>) -> Result<(), StoreError> {
            self.inner.delete_by_ids(ids).await
        }

        async fn insert(&self, task: NewTask) -> Result<TaskRecord, StoreError> {
            self.inner.insert(task).await
        }

        async fn complete_with_followups(
            &self,
            done: &HashSet<TaskId>,
            followups: Vec<NewTask>,
        ) -> Result<Vec<TaskRecord>, StoreError> {
            self.inner.complete_with_followups(done, followups).await
        }

        async fn count_pending(&self) -> Result<usize, StoreError> {
            self.inner.count_pending().await
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            multiplier: 2.0,
            max_delay: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let store = RetryingTaskStore::new(Flaky::new(2, true), fast_policy(3));
        let result = store
            .query_eligible(&EligibleQuery::new(Utc::now(), 10))
            .await;
        assert!(result.is_ok());
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let store = RetryingTaskStore::new(Flaky::new(10, true), fast_policy(3));
        let result = store
            .query_eligible(&EligibleQuery::new(Utc::now(), 10))
            .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_fail_fast() {
        let store = RetryingTaskStore::new(Flaky::new(1, false), fast_policy(5));
        let result = store
            .query_eligible(&EligibleQuery::new(Utc::now(), 10))
            .await;
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 1);
    }
}
