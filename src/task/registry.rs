//! Registry of running tasks, keyed by name.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::TaskError;
use crate::task::cancellable::TaskControl;
use crate::task::state::TaskSnapshot;

/// Name → task map shared by the scheduler and the tasks it starts.
///
/// At most one task per name is registered at a time. An entry is removed
/// when its task body returns, not when the supervisor gives up on it, so a
/// killed worker that is still unwinding keeps its name reserved.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<RwLock<HashMap<String, Arc<TaskControl>>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, control: Arc<TaskControl>) -> Result<(), TaskError> {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        if tasks.contains_key(control.name()) {
            return Err(TaskError::DuplicateName {
                name: control.name().to_string(),
            });
        }
        tasks.insert(control.name().to_string(), control);
        Ok(())
    }

    /// Remove `control` if it is still the entry under its name.
    pub(crate) fn remove(&self, control: &Arc<TaskControl>) -> bool {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        match tasks.get(control.name()) {
            Some(current) if Arc::ptr_eq(current, control) => {
                tasks.remove(control.name());
                true
            }
            _ => false,
        }
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<TaskControl>> {
        self.tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Snapshots of all registered tasks, sorted by name.
    pub fn enumerate(&self) -> Vec<TaskSnapshot> {
        let mut snapshots: Vec<TaskSnapshot> = self
            .tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|control| control.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Request cancellation of every registered task. Returns how many.
    pub fn cancel_all(&self) -> usize {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        for control in tasks.values() {
            control.request_cancel();
        }
        tasks.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
