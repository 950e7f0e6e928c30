//! Task store: the forest behind one lock, written through to the journal.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::task::{Task, TaskId, TreeId};
use crate::core::tree::{TaskForest, TreeStatus, TreeSummary};
use crate::error::Result;
use crate::state::Journal;

/// Shared handle to every task record.
///
/// The forest is guarded by a single mutex. Holding it serialises status
/// writes and parent readiness checks; it must be taken before the event
/// log's lock, never after.
#[derive(Clone, Default)]
pub struct TaskStore {
    forest: Arc<Mutex<TaskForest>>,
    journal: Option<Arc<Journal>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(forest: TaskForest, journal: Arc<Journal>) -> Self {
        Self {
            forest: Arc::new(Mutex::new(forest)),
            journal: Some(journal),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, TaskForest> {
        self.forest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write a task snapshot to the journal, if one is attached.
    pub fn persist(&self, task: &Task) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.append_task(task),
            None => Ok(()),
        }
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.lock().get(id).cloned()
    }

    pub fn tree(&self, tree_id: TreeId) -> Option<Vec<Task>> {
        self.lock()
            .tree_tasks(tree_id)
            .map(|tasks| tasks.into_iter().cloned().collect())
    }

    pub fn tree_status(&self, tree_id: TreeId) -> Option<TreeStatus> {
        self.lock().tree_status(tree_id)
    }

    pub fn summaries(&self) -> Vec<TreeSummary> {
        self.lock().summaries()
    }
}
