//! TaskDispatcher - タスク種別ごとのバッチ実行
//!
//! One dispatcher per registered task type. It owns an unbounded inbox fed
//! by the coordinator, groups what it receives into batches of at most
//! `max_tasks_per_batch`, and keeps at most `max_batch_count` batches running.
//! Every member of a batch is reported back with the same shared outcome.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DispatcherOptions;
use crate::domain::{BatchOutcome, BatchResult, TaskRecord, TaskType};
use crate::typed::{DynHandler, Registration};

/// Coordinator-side view of a dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    task_type: TaskType,
    options: DispatcherOptions,
    inbox: mpsc::UnboundedSender<TaskRecord>,
    running: watch::Receiver<usize>,
}

impl DispatcherHandle {
    /// Enqueue one task. Never blocks; returns `false` only when the
    /// dispatcher loop has already exited.
    pub fn schedule(&self, task: TaskRecord) -> bool {
        self.inbox.send(task).is_ok()
    }

    /// The configured number of batches is running.
    pub fn is_full(&self) -> bool {
        self.running_batches() >= self.options.max_batch_count
    }

    pub fn running_batches(&self) -> usize {
        *self.running.borrow()
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn options(&self) -> DispatcherOptions {
        self.options
    }
}

pub struct TaskDispatcher {
    task_type: TaskType,
    options: DispatcherOptions,
    inbox: mpsc::UnboundedReceiver<TaskRecord>,
    runner: BatchRunner,
    batches: JoinSet<()>,
}

impl TaskDispatcher {
    pub fn new(
        task_type: TaskType,
        registration: Registration,
        results: mpsc::UnboundedSender<BatchResult>,
    ) -> (Self, DispatcherHandle) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (running_tx, running_rx) = watch::channel(0);
        let options = registration.options;

        let dispatcher = Self {
            task_type: task_type.clone(),
            options,
            inbox: inbox_rx,
            runner: BatchRunner {
                task_type: task_type.clone(),
                handler: registration.handler,
                handles_deletion: options.handles_deletion,
                results,
                running: Arc::new(running_tx),
            },
            batches: JoinSet::new(),
        };
        let handle = DispatcherHandle {
            task_type,
            options,
            inbox: inbox_tx,
            running: running_rx,
        };
        (dispatcher, handle)
    }

    /// Runs until `cancel` fires or every `DispatcherHandle` is dropped, then
    /// waits for the batches already started.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            task_type = %self.task_type,
            max_batch_count = self.options.max_batch_count,
            max_tasks_per_batch = self.options.max_tasks_per_batch,
            "dispatcher started"
        );

        loop {
            while let Some(joined) = self.batches.try_join_next() {
                self.on_joined(joined);
            }

            if self.batches.len() >= self.options.max_batch_count {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    Some(joined) = self.batches.join_next() => {
                        self.on_joined(joined);
                        continue;
                    }
                }
            }

            // The only place that waits for new work.
            let first = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(joined) = self.batches.join_next() => {
                    self.on_joined(joined);
                    continue;
                }
                task = self.inbox.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            self.start_batch(first, &cancel);
            while self.batches.len() < self.options.max_batch_count {
                match self.inbox.try_recv() {
                    Ok(task) => self.start_batch(task, &cancel),
                    Err(_) => break,
                }
            }
        }

        let pending = self.batches.len();
        if pending > 0 {
            info!(task_type = %self.task_type, pending, "dispatcher waiting for running batches");
        }
        while let Some(joined) = self.batches.join_next().await {
            self.on_joined(joined);
        }
        info!(task_type = %self.task_type, "dispatcher stopped");
    }

    /// Fill a batch starting with `first`, then spawn it.
    fn start_batch(&mut self, first: TaskRecord, cancel: &CancellationToken) {
        let mut batch = Vec::with_capacity(self.options.max_tasks_per_batch);
        batch.push(first);
        while batch.len() < self.options.max_tasks_per_batch {
            match self.inbox.try_recv() {
                Ok(task) => batch.push(task),
                Err(_) => break,
            }
        }

        self.runner.running.send_modify(|n| *n += 1);
        debug!(
            task_type = %self.task_type,
            size = batch.len(),
            running = self.batches.len() + 1,
            "starting batch"
        );
        let runner = self.runner.clone();
        self.batches.spawn(runner.run(batch, cancel.child_token()));
    }

    fn on_joined(&self, joined: Result<(), tokio::task::JoinError>) {
        if let Err(e) = joined {
            error!(task_type = %self.task_type, error = %e, "batch task did not complete");
        }
    }
}

/// What one spawned batch needs; cloned per batch.
#[derive(Clone)]
struct BatchRunner {
    task_type: TaskType,
    handler: Arc<dyn DynHandler>,
    handles_deletion: bool,
    results: mpsc::UnboundedSender<BatchResult>,
    running: Arc<watch::Sender<usize>>,
}

impl BatchRunner {
    async fn run(self, batch: Vec<TaskRecord>, cancel: CancellationToken) {
        let size = batch.len();
        let result = AssertUnwindSafe(self.handler.handle_dyn(&batch, cancel))
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(())) => {
                debug!(task_type = %self.task_type, size, "batch succeeded");
                BatchOutcome::Succeeded
            }
            Ok(Err(e)) => {
                warn!(task_type = %self.task_type, size, error = %e, "batch faulted");
                BatchOutcome::from(Err(e))
            }
            Err(panic) => {
                let reason = format!("handler panicked: {}", panic_message(panic.as_ref()));
                error!(task_type = %self.task_type, size, %reason, "batch faulted");
                BatchOutcome::faulted(reason)
            }
        };

        // Free the slot before reporting, so the coordinator's next refill
        // already sees this type as not full.
        self.running.send_modify(|n| *n = n.saturating_sub(1));

        let outcome = Arc::new(outcome);
        for task in batch {
            let report = BatchResult {
                task,
                outcome: Arc::clone(&outcome),
                handles_deletion: self.handles_deletion,
            };
            if self.results.send(report).is_err() {
                debug!(task_type = %self.task_type, "results channel closed, dropping batch report");
                break;
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
