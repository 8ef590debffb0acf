//! Notification tasks and their handlers.
//!
//! Delivery itself is simulated: the handlers log what they would send.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use courier_core::app::TaskNotifier;
use courier_core::{Envelope, Handler, HandlerError, NewTask, Task, TaskStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendEmail {
    pub user_id: i64,
    pub message_id: i64,
}

impl Task for SendEmail {
    const TYPE: &'static str = "notify.email.send.v1";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendPush {
    pub user_id: i64,
    pub message_id: i64,
}

impl Task for SendPush {
    const TYPE: &'static str = "notify.push.send.v1";
}

/// A new post that every listed subscriber should hear about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutNotification {
    pub post_id: i64,
    pub subscriber_ids: Vec<i64>,
}

impl Task for FanOutNotification {
    const TYPE: &'static str = "notify.fanout.v1";
}

pub struct EmailHandler;

#[async_trait]
impl Handler<SendEmail> for EmailHandler {
    async fn handle(
        &self,
        batch: Vec<Envelope<SendEmail>>,
        cancel: CancellationToken,
    ) -> Result<(), HandlerError> {
        for task in batch {
            if cancel.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }
            info!(
                task_id = %task.id,
                user_id = task.payload.user_id,
                message_id = task.payload.message_id,
                "sending email"
            );
        }
        Ok(())
    }
}

pub struct PushHandler;

#[async_trait]
impl Handler<SendPush> for PushHandler {
    async fn handle(
        &self,
        batch: Vec<Envelope<SendPush>>,
        cancel: CancellationToken,
    ) -> Result<(), HandlerError> {
        if cancel.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }
        let users: Vec<i64> = batch.iter().map(|t| t.payload.user_id).collect();
        info!(count = users.len(), ?users, "sending push notifications");
        Ok(())
    }
}

/// Turns one post into per-subscriber email and push tasks.
///
/// Registered with `handles_deletion`: its own tasks are deleted in the same
/// transaction that inserts the follow-ups.
pub struct FanOutHandler {
    store: Arc<dyn TaskStore>,
    notifier: TaskNotifier,
}

impl FanOutHandler {
    pub fn new(store: Arc<dyn TaskStore>, notifier: TaskNotifier) -> Self {
        Self { store, notifier }
    }
}

fn encode<T: Task>(task: &T) -> Result<NewTask, HandlerError> {
    NewTask::of(task).map_err(|e| HandlerError::failed(format!("encode {}: {e}", T::TYPE)))
}

#[async_trait]
impl Handler<FanOutNotification> for FanOutHandler {
    async fn handle(
        &self,
        batch: Vec<Envelope<FanOutNotification>>,
        _cancel: CancellationToken,
    ) -> Result<(), HandlerError> {
        let mut done = HashSet::with_capacity(batch.len());
        let mut followups = Vec::new();
        for task in &batch {
            done.insert(task.id);
            for &user_id in &task.payload.subscriber_ids {
                let message_id = task.payload.post_id;
                followups.push(encode(&SendEmail { user_id, message_id })?);
                followups.push(encode(&SendPush { user_id, message_id })?);
            }
        }

        let inserted = self.store.complete_with_followups(&done, followups).await?;
        info!(
            posts = done.len(),
            inserted = inserted.len(),
            "fanned out notifications"
        );
        if !inserted.is_empty() {
            self.notifier.notify();
        }
        Ok(())
    }
}
