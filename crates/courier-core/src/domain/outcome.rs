//! Batch outcomes.
//!
//! A batch succeeds or faults as a whole. The dispatcher builds exactly one
//! `BatchOutcome` per handler invocation and hands the same `Arc` to every
//! member's `BatchResult`, so the coordinator never sees two members of one
//! batch disagree.

use serde::Serialize;
use std::sync::Arc;

use super::errors::HandlerError;
use super::TaskRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchOutcome {
    Succeeded,
    Faulted { reason: String },
}

impl BatchOutcome {
    pub fn faulted(reason: impl Into<String>) -> Self {
        Self::Faulted {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl From<Result<(), HandlerError>> for BatchOutcome {
    fn from(result: Result<(), HandlerError>) -> Self {
        match result {
            Ok(()) => Self::Succeeded,
            Err(e) => Self::faulted(e.to_string()),
        }
    }
}

/// Outcome handle shared by all members of one batch.
pub type SharedOutcome = Arc<BatchOutcome>;

/// Per-task report sent from a dispatcher back to the coordinator.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub task: TaskRecord,
    pub outcome: SharedOutcome,
    /// The handler already removed the task from the store itself.
    pub handles_deletion: bool,
}
