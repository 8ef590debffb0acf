//! TaskNotifier - 新規タスクの通知
//!
//! A single-slot wakeup flag. `notify()` stores at most one permit, so any
//! number of calls made while the coordinator is busy collapse into one
//! extra refill, and a call racing the coordinator's transition to sleep is
//! never lost.

use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, Default)]
pub struct TaskNotifier {
    inner: Arc<Notify>,
}

impl TaskNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal that new tasks were committed to the store.
    pub fn notify(&self) {
        self.inner.notify_one();
    }

    /// Completes once a permit is available, consuming it.
    pub async fn notified(&self) {
        self.inner.notified().await;
    }
}
