//! BackgroundTaskManager - ストアとディスパッチャの間の調整ループ
//!
//! Each cycle:
//! 1. refill: query eligible tasks (skipping full, quarantined and
//!    unroutable types and every id it already owns) and route them
//! 2. drain: consume batch results without waiting
//! 3. flush: bulk delete succeeded tasks
//! 4. loop again if more work may exist, otherwise sleep until a notify,
//!    a batch result, a command, a timer or cancellation
//!
//! The coordinator is the only owner of the in-flight and pending-deletion
//! sets; dispatchers talk to it through channels.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::dispatcher::{DispatcherHandle, TaskDispatcher};
use super::handle::ManagerCommand;
use super::notifier::TaskNotifier;
use super::status::{DispatcherStatus, ManagerStatus};
use crate::config::EngineConfig;
use crate::domain::{
    BatchOutcome, BatchResult, CoordinatorState, StoreError, TaskId, TaskRecord, TaskType,
};
use crate::ports::{Clock, EligibleQuery, TaskStore};
use crate::typed::TypedRegistry;

pub struct BackgroundTaskManager {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    dispatchers: HashMap<TaskType, DispatcherHandle>,
    unstarted: Vec<TaskDispatcher>,
    results: mpsc::UnboundedReceiver<BatchResult>,
    commands: mpsc::Receiver<ManagerCommand>,
    wakeup: TaskNotifier,
    in_flight: HashSet<TaskId>,
    pending_deletion: HashSet<TaskId>,
    /// Value is the release time; `None` means until restart or re-enable.
    quarantined: HashMap<TaskType, Option<Instant>>,
    unroutable: HashSet<TaskType>,
    more_work: bool,
    state: CoordinatorState,
}

impl BackgroundTaskManager {
    pub(crate) fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
        registry: TypedRegistry,
        commands: mpsc::Receiver<ManagerCommand>,
        wakeup: TaskNotifier,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let mut dispatchers = HashMap::with_capacity(registry.len());
        let mut unstarted = Vec::with_capacity(registry.len());
        for (task_type, registration) in registry.into_entries() {
            let (dispatcher, handle) =
                TaskDispatcher::new(task_type.clone(), registration, results_tx.clone());
            dispatchers.insert(task_type, handle);
            unstarted.push(dispatcher);
        }

        Self {
            store,
            clock,
            config,
            dispatchers,
            unstarted,
            results: results_rx,
            commands,
            wakeup,
            in_flight: HashSet::new(),
            pending_deletion: HashSet::new(),
            quarantined: HashMap::new(),
            unroutable: HashSet::new(),
            more_work: true,
            state: CoordinatorState::Idle,
        }
    }

    /// Spawn the dispatcher loops and the coordinator loop.
    ///
    /// The returned handle resolves after a graceful stop: running batches
    /// finished, their results drained, succeeded tasks deleted.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        // Own token so a `Shutdown` command does not cancel the caller's.
        let root = cancel.child_token();
        let mut loops = JoinSet::new();
        for dispatcher in self.unstarted.drain(..) {
            loops.spawn(dispatcher.run(root.child_token()));
        }
        info!(
            task_types = self.dispatchers.len(),
            page_size = self.config.query_page_size,
            quarantine = ?self.config.quarantine,
            "background task manager started"
        );

        self.coordinate(&root).await;
        self.stop(loops).await;
    }

    async fn coordinate(&mut self, cancel: &CancellationToken) {
        while !cancel.is_cancelled() {
            while let Ok(command) = self.commands.try_recv() {
                self.handle_command(command, cancel).await;
            }
            self.release_expired_quarantines();

            let mut failed = false;
            if self.more_work {
                if let Err(e) = self.refill().await {
                    error!(error = %e, "failed to query eligible tasks");
                    failed = true;
                }
            }
            self.drain_results();
            if let Err(e) = self.flush_deletions().await {
                error!(
                    error = %e,
                    pending = self.pending_deletion.len(),
                    "failed to delete completed tasks"
                );
                failed = true;
            }

            if failed {
                self.backoff(cancel).await;
            } else if self.more_work {
                // A full page loops straight back to refill. Dispatchers and
                // batches share the runtime with this loop, and on a
                // current-thread runtime this yield is their only turn.
                tokio::task::yield_now().await;
            } else {
                self.idle(cancel).await;
            }
        }
    }

    async fn refill(&mut self) -> Result<(), StoreError> {
        self.set_state(CoordinatorState::Refilling);

        let mut query = EligibleQuery::new(self.clock.now(), self.config.query_page_size);
        query.exclude_types.extend(self.quarantined.keys().cloned());
        query.exclude_types.extend(self.unroutable.iter().cloned());
        query.exclude_types.extend(
            self.dispatchers
                .values()
                .filter(|d| d.is_full())
                .map(|d| d.task_type().clone()),
        );
        // Pending deletions stay excluded so a failed delete never leads to a
        // second dispatch.
        query.exclude_ids.extend(self.in_flight.iter().copied());
        query.exclude_ids.extend(self.pending_deletion.iter().copied());

        let tasks = self.store.query_eligible(&query).await?;
        self.more_work = tasks.len() >= query.limit;
        trace!(
            fetched = tasks.len(),
            excluded_types = query.exclude_types.len(),
            excluded_ids = query.exclude_ids.len(),
            more_work = self.more_work,
            "refilled"
        );

        if !tasks.is_empty() {
            self.set_state(CoordinatorState::Dispatching);
            for task in tasks {
                self.route(task);
            }
        }
        Ok(())
    }

    fn route(&mut self, task: TaskRecord) {
        let Some(dispatcher) = self.dispatchers.get(&task.task_type) else {
            if self.unroutable.insert(task.task_type.clone()) {
                warn!(
                    task_type = %task.task_type,
                    "stored task has no registered handler, excluding its type"
                );
            }
            return;
        };

        let id = task.id;
        if dispatcher.schedule(task) {
            self.in_flight.insert(id);
        } else {
            warn!(task_id = %id, "dispatcher is gone, task left in store");
        }
    }

    fn drain_results(&mut self) {
        let mut drained = 0usize;
        while let Ok(result) = self.results.try_recv() {
            if drained == 0 {
                self.set_state(CoordinatorState::Draining);
            }
            self.apply_result(result);
            drained += 1;
        }
        if drained > 0 {
            debug!(drained, in_flight = self.in_flight.len(), "drained batch results");
            // A finished batch frees a slot; its type may have more rows.
            self.more_work = true;
        }
    }

    fn apply_result(&mut self, result: BatchResult) {
        let BatchResult {
            task,
            outcome,
            handles_deletion,
        } = result;
        self.in_flight.remove(&task.id);

        match outcome.as_ref() {
            BatchOutcome::Succeeded => {
                if !handles_deletion {
                    self.pending_deletion.insert(task.id);
                }
            }
            BatchOutcome::Faulted { reason } => self.quarantine(&task.task_type, reason),
        }
    }

    fn quarantine(&mut self, task_type: &TaskType, reason: &str) {
        if self.quarantined.contains_key(task_type) {
            return;
        }
        let cooldown = self.config.quarantine.cooldown();
        error!(
            task_type = %task_type,
            %reason,
            cooldown_secs = cooldown.map(|d| d.as_secs()),
            "batch faulted, task type quarantined; its tasks stay in the store"
        );
        self.quarantined
            .insert(task_type.clone(), cooldown.map(|d| Instant::now() + d));
    }

    fn release_expired_quarantines(&mut self) {
        let now = Instant::now();
        let expired: Vec<TaskType> = self
            .quarantined
            .iter()
            .filter(|(_, release_at)| matches!(release_at, Some(at) if *at <= now))
            .map(|(task_type, _)| task_type.clone())
            .collect();
        for task_type in expired {
            self.quarantined.remove(&task_type);
            info!(task_type = %task_type, "quarantine cooldown elapsed, task type re-enabled");
            self.more_work = true;
        }
    }

    fn reenable(&mut self, task_type: &TaskType) -> bool {
        let was_quarantined = self.quarantined.remove(task_type).is_some();
        if was_quarantined {
            info!(task_type = %task_type, "task type re-enabled");
            self.more_work = true;
        }
        was_quarantined
    }

    async fn flush_deletions(&mut self) -> Result<(), StoreError> {
        if self.pending_deletion.is_empty() {
            return Ok(());
        }
        self.store.delete_by_ids(&self.pending_deletion).await?;
        debug!(count = self.pending_deletion.len(), "deleted completed tasks");
        self.pending_deletion.clear();
        Ok(())
    }

    /// Sleep until the first of: notify, batch result, command, poll or
    /// cooldown timer, cancellation.
    async fn idle(&mut self, cancel: &CancellationToken) {
        self.set_state(CoordinatorState::Idle);
        let timeout = self.next_timer();
        let timer = async move {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.wakeup.notified() => {
                trace!("woken by notify");
                self.more_work = true;
            }
            Some(result) = self.results.recv() => {
                self.apply_result(result);
                self.more_work = true;
            }
            Some(command) = self.commands.recv() => {
                self.handle_command(command, cancel).await;
            }
            _ = timer => {
                trace!("woken by timer");
                self.more_work = true;
            }
        }
    }

    async fn backoff(&mut self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.config.error_backoff()) => {}
        }
    }

    /// Earliest of the poll interval and the next quarantine release.
    fn next_timer(&self) -> Option<Duration> {
        let now = Instant::now();
        let cooldown = self
            .quarantined
            .values()
            .flatten()
            .min()
            .map(|at| at.saturating_duration_since(now));
        match (self.config.poll_interval(), cooldown) {
            (Some(poll), Some(cooldown)) => Some(poll.min(cooldown)),
            (poll, cooldown) => poll.or(cooldown),
        }
    }

    async fn handle_command(&mut self, command: ManagerCommand, cancel: &CancellationToken) {
        match command {
            ManagerCommand::Status { response } => {
                let status = self.status().await;
                let _ = response.send(status);
            }
            ManagerCommand::Reenable {
                task_type,
                response,
            } => {
                let was_quarantined = self.reenable(&task_type);
                let _ = response.send(was_quarantined);
            }
            ManagerCommand::Shutdown => {
                info!("shutdown requested");
                cancel.cancel();
            }
        }
    }

    async fn status(&mut self) -> ManagerStatus {
        let stored = match self.store.count_pending().await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(error = %e, "failed to count stored tasks");
                None
            }
        };

        let mut quarantined: Vec<TaskType> = self.quarantined.keys().cloned().collect();
        quarantined.sort();
        let mut unroutable: Vec<TaskType> = self.unroutable.iter().cloned().collect();
        unroutable.sort();
        let mut dispatchers: Vec<DispatcherStatus> = self
            .dispatchers
            .values()
            .map(|d| {
                let options = d.options();
                DispatcherStatus {
                    task_type: d.task_type().clone(),
                    running_batches: d.running_batches(),
                    max_batch_count: options.max_batch_count,
                    max_tasks_per_batch: options.max_tasks_per_batch,
                    is_full: d.is_full(),
                    quarantined: self.quarantined.contains_key(d.task_type()),
                }
            })
            .collect();
        dispatchers.sort_by(|a, b| a.task_type.cmp(&b.task_type));

        ManagerStatus {
            state: self.state,
            in_flight: self.in_flight.len(),
            pending_deletion: self.pending_deletion.len(),
            stored,
            quarantined,
            unroutable,
            dispatchers,
        }
    }

    async fn stop(&mut self, mut loops: JoinSet<()>) {
        info!(in_flight = self.in_flight.len(), "stopping, waiting for running batches");
        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "dispatcher loop did not complete");
            }
        }

        self.drain_results();
        if let Err(e) = self.flush_deletions().await {
            error!(
                error = %e,
                pending = self.pending_deletion.len(),
                "failed to delete completed tasks on shutdown; they will run again on next start"
            );
        }
        self.set_state(CoordinatorState::Stopped);
        info!("background task manager stopped");
    }

    fn set_state(&mut self, state: CoordinatorState) {
        if self.state != state {
            trace!(from = %self.state, to = %state, "coordinator state");
            self.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuarantinePolicy;
    use crate::impls::InMemoryTaskStore;
    use crate::ports::SystemClock;
    use chrono::Utc;
    use ulid::Ulid;

    fn manager(config: EngineConfig) -> BackgroundTaskManager {
        let (_tx, rx) = mpsc::channel(1);
        BackgroundTaskManager::new(
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(SystemClock),
            config,
            TypedRegistry::new(),
            rx,
            TaskNotifier::new(),
        )
    }

    fn result(task_type: &str, outcome: BatchOutcome, handles_deletion: bool) -> BatchResult {
        BatchResult {
            task: TaskRecord {
                id: TaskId::from_ulid(Ulid::new()),
                task_type: TaskType::new(task_type),
                created: Utc::now(),
                wait_until: None,
                payload: serde_json::json!({}),
            },
            outcome: Arc::new(outcome),
            handles_deletion,
        }
    }

    #[tokio::test]
    async fn success_queues_deletion_unless_handler_owns_it() {
        let mut m = manager(EngineConfig::default());
        let owned = result("a", BatchOutcome::Succeeded, false);
        let self_deleted = result("b", BatchOutcome::Succeeded, true);
        m.in_flight.insert(owned.task.id);
        m.in_flight.insert(self_deleted.task.id);

        m.apply_result(owned.clone());
        m.apply_result(self_deleted);

        assert!(m.in_flight.is_empty());
        assert_eq!(m.pending_deletion, HashSet::from([owned.task.id]));
    }

    #[tokio::test]
    async fn fault_quarantines_and_keeps_task() {
        let mut m = manager(EngineConfig::default());
        m.apply_result(result("a", BatchOutcome::faulted("boom"), false));

        assert!(m.pending_deletion.is_empty());
        assert_eq!(m.quarantined.get(&TaskType::new("a")), Some(&None));
        assert!(m.reenable(&TaskType::new("a")));
        assert!(!m.reenable(&TaskType::new("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_quarantine_expires() {
        let config = EngineConfig {
            quarantine: QuarantinePolicy::Cooldown { cooldown_secs: 30 },
            poll_interval_secs: 60,
            ..EngineConfig::default()
        };
        let mut m = manager(config);
        m.apply_result(result("a", BatchOutcome::faulted("boom"), false));
        assert_eq!(m.next_timer(), Some(Duration::from_secs(30)));

        tokio::time::advance(Duration::from_secs(31)).await;
        m.more_work = false;
        m.release_expired_quarantines();

        assert!(m.quarantined.is_empty());
        assert!(m.more_work);
        assert_eq!(m.next_timer(), Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn no_timer_without_poll_or_cooldown() {
        let config = EngineConfig {
            poll_interval_secs: 0,
            ..EngineConfig::default()
        };
        let mut m = manager(config);
        m.apply_result(result("a", BatchOutcome::faulted("boom"), false));
        assert_eq!(m.next_timer(), None);
    }

    #[tokio::test]
    async fn unknown_type_is_marked_unroutable_once() {
        let mut m = manager(EngineConfig::default());
        let r = result("nobody.v1", BatchOutcome::Succeeded, false);
        m.route(r.task.clone());
        m.route(r.task);

        assert!(m.in_flight.is_empty());
        assert_eq!(m.unroutable.len(), 1);
    }
}
