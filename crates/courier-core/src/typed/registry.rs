//! TypedRegistry - handler and dispatcher options per task type.
//!
//! Filled once at startup and then turned into the immutable
//! `TaskType -> dispatcher` table the coordinator routes with.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::handler::{DynHandler, Handler, TypedHandler};
use super::task::Task;
use crate::config::{ConfigError, DispatcherOptions};
use crate::domain::TaskType;

/// What is known about one registered task type.
#[derive(Clone)]
pub struct Registration {
    pub handler: Arc<dyn DynHandler>,
    pub options: DispatcherOptions,
}

#[derive(Default)]
pub struct TypedRegistry {
    entries: BTreeMap<TaskType, Registration>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Handler for task type '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("Invalid dispatcher options for task type '{task_type}': {source}")]
    InvalidOptions {
        task_type: String,
        #[source]
        source: ConfigError,
    },
}

impl TypedRegistry {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
        options: DispatcherOptions,
    ) -> Result<(), RegistryError> {
        let task_type = TaskType::of::<T>();
        if self.entries.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type.to_string()));
        }
        options
            .validate()
            .map_err(|source| RegistryError::InvalidOptions {
                task_type: task_type.to_string(),
                source,
            })?;
        let handler: Arc<dyn DynHandler> = Arc::new(TypedHandler::new(handler));
        self.entries
            .insert(task_type, Registration { handler, options });
        Ok(())
    }

    pub fn get(&self, task_type: &TaskType) -> Option<&Registration> {
        self.entries.get(task_type)
    }

    /// Replace the options of an already registered type.
    pub fn override_options(
        &mut self,
        task_type: &TaskType,
        options: DispatcherOptions,
    ) -> Result<bool, RegistryError> {
        options
            .validate()
            .map_err(|source| RegistryError::InvalidOptions {
                task_type: task_type.to_string(),
                source,
            })?;
        match self.entries.get_mut(task_type) {
            Some(entry) => {
                entry.options = options;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Registered tags in sorted order.
    pub fn registered_types(&self) -> Vec<String> {
        self.entries.keys().map(|t| t.to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> impl Iterator<Item = (TaskType, Registration)> {
        self.entries.into_iter()
    }
}
