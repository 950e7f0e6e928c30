//! Task forest: the arena holding every task tree.
//!
//! Tasks are petgraph nodes indexed by `TaskId`; edges point from parent to
//! child. Children are always fresh nodes, so cycles cannot form, and every
//! traversal is iterative.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::task::{Priority, Task, TaskId, TaskStatus, TreeId};
use crate::error::{Error, Result};

/// Derived status of a whole tree, a pure function of its root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TreeStatus {
    Running,
    Complete,
    Failed,
    ReviewFlagged,
}

impl TreeStatus {
    pub fn from_root(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Complete => TreeStatus::Complete,
            TaskStatus::Failed => TreeStatus::Failed,
            TaskStatus::ReviewFlagged => TreeStatus::ReviewFlagged,
            _ => TreeStatus::Running,
        }
    }
}

impl std::fmt::Display for TreeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TreeStatus::Running => write!(f, "RUNNING"),
            TreeStatus::Complete => write!(f, "COMPLETE"),
            TreeStatus::Failed => write!(f, "FAILED"),
            TreeStatus::ReviewFlagged => write!(f, "REVIEW_FLAGGED"),
        }
    }
}

/// One row of the tree listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeSummary {
    pub tree_id: TreeId,
    pub root_task: Task,
    pub task_count: usize,
    /// Whether any task in the tree is still unresolved.
    pub has_running_tasks: bool,
    pub status: TreeStatus,
    pub last_activity: DateTime<Utc>,
}

/// A resolved child, as seen by its parent's evaluation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub review_reason: Option<String>,
}

impl ChildOutcome {
    fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            result: task.result.clone(),
            error: task.error.clone(),
            review_reason: task.review_reason.clone(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status == TaskStatus::Failed
    }
}

/// Arena of all task trees.
pub struct TaskForest {
    graph: DiGraph<Task, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
    roots: HashMap<TreeId, TaskId>,
    /// Trees in creation order.
    tree_order: Vec<TreeId>,
    next_id: u64,
}

impl Default for TaskForest {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskForest {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            roots: HashMap::new(),
            tree_order: Vec::new(),
            next_id: 1,
        }
    }

    fn allocate_id(&mut self) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        id
    }

    fn add_node(&mut self, task: Task) -> NodeIndex {
        let id = task.id;
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    /// Create a new tree with a single CREATED root.
    pub fn create_root(&mut self, instruction: &str, priority: Priority) -> Task {
        let id = self.allocate_id();
        let tree_id = TreeId::new();
        let task = Task::root(id, tree_id, instruction, priority);

        self.add_node(task.clone());
        self.roots.insert(tree_id, id);
        self.tree_order.push(tree_id);
        task
    }

    /// Create a CREATED child under a RUNNING parent, in the parent's tree.
    ///
    /// # Errors
    /// - `UnknownTask` if the parent does not exist
    /// - `InvalidParentState` if the parent is not RUNNING
    pub fn create_child(
        &mut self,
        parent_id: TaskId,
        instruction: &str,
        agent_hint: Option<String>,
    ) -> Result<Task> {
        let parent_index = *self
            .task_index
            .get(&parent_id)
            .ok_or(Error::UnknownTask(parent_id))?;
        let status = self.graph[parent_index].status;
        if status != TaskStatus::Running {
            return Err(Error::InvalidParentState { parent_id, status });
        }

        let id = self.allocate_id();
        let child = Task::child(id, &self.graph[parent_index], instruction, agent_hint);
        let child_index = self.add_node(child.clone());
        self.graph.add_edge(parent_index, child_index, ());
        Ok(child)
    }

    /// Remove freshly created tasks again, newest first.
    ///
    /// Only childless CREATED tasks that are still the newest nodes can be
    /// discarded, which keeps every other node index stable. Ids are not
    /// handed out again.
    pub fn discard_created(&mut self, ids: &[TaskId]) -> Result<()> {
        for &id in ids.iter().rev() {
            let index = *self.task_index.get(&id).ok_or(Error::UnknownTask(id))?;
            let is_newest = index.index() + 1 == self.graph.node_count();
            let has_children = self
                .graph
                .neighbors_directed(index, Direction::Outgoing)
                .next()
                .is_some();
            if self.graph[index].status != TaskStatus::Created || has_children || !is_newest {
                return Err(Error::Store(format!("task {} cannot be discarded", id)));
            }

            if let Some(task) = self.graph.remove_node(index) {
                if task.is_root() {
                    self.roots.remove(&task.tree_id);
                    self.tree_order.retain(|&tree_id| tree_id != task.tree_id);
                }
            }
            self.task_index.remove(&id);
        }
        Ok(())
    }

    /// Re-insert a task loaded from persistent storage.
    ///
    /// Tasks must arrive parents-first (ascending id order guarantees this).
    pub fn insert_restored(&mut self, task: Task) -> Result<()> {
        if self.task_index.contains_key(&task.id) {
            return Err(Error::Store(format!("duplicate task {}", task.id)));
        }

        let parent_index = match task.parent_id {
            Some(parent_id) => {
                let index = *self.task_index.get(&parent_id).ok_or_else(|| {
                    Error::Store(format!("task {} references missing parent {}", task.id, parent_id))
                })?;
                if self.graph[index].tree_id != task.tree_id {
                    return Err(Error::Store(format!(
                        "task {} crosses tree boundary to parent {}",
                        task.id, parent_id
                    )));
                }
                Some(index)
            }
            None => {
                if self.roots.contains_key(&task.tree_id) {
                    return Err(Error::Store(format!(
                        "tree {} has more than one root",
                        task.tree_id
                    )));
                }
                None
            }
        };

        self.next_id = self.next_id.max(task.id.0 + 1);
        let (id, tree_id) = (task.id, task.tree_id);
        let index = self.add_node(task);
        match parent_index {
            Some(parent) => {
                self.graph.add_edge(parent, index, ());
            }
            None => {
                self.roots.insert(tree_id, id);
                self.tree_order.push(tree_id);
            }
        }
        Ok(())
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.task_index.get(&id).map(|&index| &self.graph[index])
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        match self.task_index.get(&id) {
            Some(&index) => self.graph.node_weight_mut(index),
            None => None,
        }
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.task_index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All tasks in the forest.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    /// Direct children of a task, in creation order.
    pub fn children(&self, id: TaskId) -> Vec<&Task> {
        let Some(&index) = self.task_index.get(&id) else {
            return Vec::new();
        };
        let mut children: Vec<&Task> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .map(|child| &self.graph[child])
            .collect();
        children.sort_by_key(|task| task.id);
        children
    }

    pub fn child_ids(&self, id: TaskId) -> Vec<TaskId> {
        self.children(id).into_iter().map(|task| task.id).collect()
    }

    /// Whether every child of `id` is resolved. Vacuously true without children.
    pub fn all_children_resolved(&self, id: TaskId) -> bool {
        self.children(id)
            .iter()
            .all(|child| child.status.is_resolved())
    }

    pub fn child_outcomes(&self, id: TaskId) -> Vec<ChildOutcome> {
        self.children(id)
            .into_iter()
            .map(ChildOutcome::from_task)
            .collect()
    }

    /// Every descendant of `id` (not including `id`), breadth first.
    pub fn descendants(&self, id: TaskId) -> Vec<TaskId> {
        let mut found = Vec::new();
        let mut frontier = self.child_ids(id);
        while let Some(next) = frontier.pop() {
            found.push(next);
            frontier.extend(self.child_ids(next));
        }
        found.sort();
        found
    }

    /// Tree ids in creation order.
    pub fn tree_ids(&self) -> &[TreeId] {
        &self.tree_order
    }

    pub fn root(&self, tree_id: TreeId) -> Option<&Task> {
        self.roots.get(&tree_id).and_then(|&id| self.get(id))
    }

    /// Every task of one tree, ordered by id.
    pub fn tree_tasks(&self, tree_id: TreeId) -> Option<Vec<&Task>> {
        let root = self.root(tree_id)?;
        let mut tasks = vec![root];
        tasks.extend(
            self.descendants(root.id)
                .into_iter()
                .filter_map(|id| self.get(id)),
        );
        tasks.sort_by_key(|task| task.id);
        Some(tasks)
    }

    pub fn tree_status(&self, tree_id: TreeId) -> Option<TreeStatus> {
        self.root(tree_id)
            .map(|root| TreeStatus::from_root(root.status))
    }

    pub fn summary(&self, tree_id: TreeId) -> Option<TreeSummary> {
        let tasks = self.tree_tasks(tree_id)?;
        let root = tasks.iter().find(|task| task.is_root())?;
        let last_activity = tasks
            .iter()
            .map(|task| task.latest_timestamp())
            .max()
            .unwrap_or(root.created_at);

        Some(TreeSummary {
            tree_id,
            root_task: (*root).clone(),
            task_count: tasks.len(),
            has_running_tasks: tasks.iter().any(|task| !task.status.is_resolved()),
            status: TreeStatus::from_root(root.status),
            last_activity,
        })
    }

    /// Summaries of every tree, in creation order.
    pub fn summaries(&self) -> Vec<TreeSummary> {
        self.tree_order
            .iter()
            .filter_map(|&tree_id| self.summary(tree_id))
            .collect()
    }

    /// Check the forest's structural invariants.
    ///
    /// Every tree has exactly one root, every parent lives in its child's
    /// tree, and every task is reachable from its tree's root.
    pub fn validate(&self) -> Result<()> {
        let mut reachable = 0;
        for &tree_id in &self.tree_order {
            let tasks = self
                .tree_tasks(tree_id)
                .ok_or_else(|| Error::Validation(format!("tree {} has no root", tree_id)))?;
            let roots = tasks.iter().filter(|task| task.is_root()).count();
            if roots != 1 {
                return Err(Error::Validation(format!(
                    "tree {} has {} roots",
                    tree_id, roots
                )));
            }
            if let Some(stray) = tasks.iter().find(|task| task.tree_id != tree_id) {
                return Err(Error::Validation(format!(
                    "task {} reachable from tree {} belongs to {}",
                    stray.id, tree_id, stray.tree_id
                )));
            }
            reachable += tasks.len();
        }

        for task in self.tasks() {
            if let Some(parent_id) = task.parent_id {
                let parent = self
                    .get(parent_id)
                    .ok_or_else(|| Error::Validation(format!("missing parent {}", parent_id)))?;
                if parent.tree_id != task.tree_id {
                    return Err(Error::Validation(format!(
                        "edge {} -> {} crosses trees",
                        parent_id, task.id
                    )));
                }
            }
        }

        if reachable != self.len() {
            return Err(Error::Validation(format!(
                "{} of {} tasks reachable from a root",
                reachable,
                self.len()
            )));
        }
        Ok(())
    }
}
