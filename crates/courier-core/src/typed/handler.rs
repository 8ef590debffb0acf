//! Handler trait - batch processing for one task type.
//!
//! Business modules implement `Handler<T>` for their payload type. The
//! registry wraps it in `TypedHandler<T, H>`, which implements the
//! object-safe `DynHandler` so dispatchers can hold `Arc<dyn DynHandler>`
//! without knowing `T`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::marker::PhantomData;
use tokio_util::sync::CancellationToken;

use super::codec::PayloadCodec;
use super::task::Task;
use crate::domain::{HandlerError, TaskId, TaskRecord};

/// A decoded task together with its store metadata.
///
/// Handlers that delete their own tasks need `id`; the rest usually only
/// look at `payload`.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    pub id: TaskId,
    pub created: DateTime<Utc>,
    pub wait_until: Option<DateTime<Utc>>,
    pub payload: T,
}

impl<T: Task> Envelope<T> {
    pub fn decode(record: &TaskRecord) -> Result<Self, HandlerError> {
        let payload =
            PayloadCodec::decode::<T>(&record.payload).map_err(|e| HandlerError::Decode {
                task_id: record.id,
                reason: e.to_string(),
            })?;
        Ok(Self {
            id: record.id,
            created: record.created,
            wait_until: record.wait_until,
            payload,
        })
    }
}

/// Processes a batch of tasks of type `T`.
///
/// A batch holds between 1 and the configured `max_tasks_per_batch` items,
/// in dispatch order. Returning `Err` faults every task in the batch: none of
/// them is deleted and the task type is quarantined.
///
/// `cancel` fires when the engine shuts down. Handlers should stop early and
/// return `HandlerError::Cancelled`; they are never aborted forcibly.
///
/// # Example
/// ```ignore
/// struct SendEmailHandler;
///
/// #[async_trait]
/// impl Handler<SendEmail> for SendEmailHandler {
///     async fn handle(
///         &self,
///         batch: Vec<Envelope<SendEmail>>,
///         _cancel: CancellationToken,
///     ) -> Result<(), HandlerError> {
///         for task in batch {
///             mailer.send(task.payload.user_id, task.payload.message_id).await?;
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(
        &self,
        batch: Vec<Envelope<T>>,
        cancel: CancellationToken,
    ) -> Result<(), HandlerError>;
}

/// Object-safe form of `Handler<T>`, operating on raw store records.
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        batch: &[TaskRecord],
        cancel: CancellationToken,
    ) -> Result<(), HandlerError>;

    fn task_type(&self) -> &'static str;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(
        &self,
        batch: &[TaskRecord],
        cancel: CancellationToken,
    ) -> Result<(), HandlerError> {
        // One undecodable payload faults the whole batch, like any other
        // handler error.
        let decoded = batch
            .iter()
            .map(Envelope::<T>::decode)
            .collect::<Result<Vec<_>, _>>()?;
        self.handler.handle(decoded, cancel).await
    }

    fn task_type(&self) -> &'static str {
        T::TYPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskType;
    use crate::typed::task::fixtures::TestTask;
    use std::sync::Mutex;
    use ulid::Ulid;

    #[derive(Default)]
    struct SummingHandler {
        seen: Mutex<Vec<i32>>,
    }

    #[async_trait]
    impl Handler<TestTask> for SummingHandler {
        async fn handle(
            &self,
            batch: Vec<Envelope<TestTask>>,
            _cancel: CancellationToken,
        ) -> Result<(), HandlerError> {
            let mut seen = self.seen.lock().unwrap();
            seen.extend(batch.into_iter().map(|t| t.payload.value));
            Ok(())
        }
    }

    fn record(payload: serde_json::Value) -> TaskRecord {
        TaskRecord {
            id: TaskId::from_ulid(Ulid::new()),
            task_type: TaskType::of::<TestTask>(),
            created: Utc::now(),
            wait_until: None,
            payload,
        }
    }

    #[tokio::test]
    async fn typed_handler_decodes_batch() {
        let typed = TypedHandler::<TestTask, _>::new(SummingHandler::default());
        let batch = vec![
            record(serde_json::json!({ "value": 1 })),
            record(serde_json::json!({ "value": 2 })),
        ];

        typed
            .handle_dyn(&batch, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*typed.handler.seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(typed.task_type(), TestTask::TYPE);
    }

    #[tokio::test]
    async fn bad_payload_faults_the_batch() {
        let typed = TypedHandler::<TestTask, _>::new(SummingHandler::default());
        let bad = record(serde_json::json!({ "nope": true }));
        let bad_id = bad.id;
        let batch = vec![record(serde_json::json!({ "value": 1 })), bad];

        let err = typed
            .handle_dyn(&batch, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::Decode { task_id, .. } if task_id == bad_id));
        assert!(typed.handler.seen.lock().unwrap().is_empty());
    }
}
