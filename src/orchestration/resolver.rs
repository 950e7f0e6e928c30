//! Dependency resolver and tree manager.
//!
//! Owns tree creation, child spawning and the decision of when a parent in
//! WAITING_SUBTASKS may proceed. Every readiness check runs under the store
//! lock, so a parent is promoted exactly once no matter how many child
//! notifications race.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::core::event::{Event, EventKind};
use crate::core::task::{Priority, Task, TaskId, TaskStatus, TreeId};
use crate::core::tree::{ChildOutcome, TaskForest, TreeStatus, TreeSummary};
use crate::error::{Error, Result};
use crate::orchestration::dispatcher::SpawnRequest;
use crate::orchestration::events::EventLog;
use crate::orchestration::machine::{RunningTask, StateMachine, Transition};
use crate::orchestration::store::TaskStore;

/// What a parent does when one of its children FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildFailurePolicy {
    /// Failures are passed to the parent's evaluation, which decides.
    #[default]
    ParentDecides,
    /// Any failed child fails the parent as soon as it is promoted.
    FailParent,
}

/// A parent released from WAITING_SUBTASKS.
#[derive(Debug, Clone)]
pub struct Promotion {
    /// The parent after promotion: EVALUATING, or FAILED under `FailParent`.
    pub parent: Task,
    pub children: Vec<ChildOutcome>,
}

impl Promotion {
    /// Whether the parent still has post-processing to do.
    pub fn needs_evaluation(&self) -> bool {
        self.parent.status == TaskStatus::Evaluating
    }
}

#[derive(Clone)]
pub struct TreeManager {
    machine: StateMachine,
    policy: ChildFailurePolicy,
}

impl TreeManager {
    pub fn new(machine: StateMachine, policy: ChildFailurePolicy) -> Self {
        Self { machine, policy }
    }

    fn store(&self) -> &TaskStore {
        self.machine.store()
    }

    fn events(&self) -> &EventLog {
        self.machine.events()
    }

    /// Start a new tree with one CREATED root.
    pub fn create_tree(&self, instruction: &str, priority: Priority) -> Result<Task> {
        let mut forest = self.store().lock();
        let root = forest.create_root(instruction, priority);
        self.record_or_discard(&mut forest, &root)?;
        info!(task_id = %root.id, tree_id = %root.tree_id, "tree created");
        Ok(root)
    }

    /// Create one CREATED child under a RUNNING parent.
    ///
    /// # Errors
    /// - `UnknownTask` if the parent does not exist
    /// - `InvalidParentState` if the parent is not RUNNING
    pub fn spawn_child(
        &self,
        parent_id: TaskId,
        instruction: &str,
        agent_hint: Option<String>,
    ) -> Result<Task> {
        let mut forest = self.store().lock();
        let child = forest.create_child(parent_id, instruction, agent_hint)?;
        self.record_or_discard(&mut forest, &child)?;
        debug!(%parent_id, child_id = %child.id, "child spawned");
        Ok(child)
    }

    /// Record a task that was just created, removing it from the forest
    /// again if it cannot be recorded.
    fn record_or_discard(&self, forest: &mut TaskForest, task: &Task) -> Result<()> {
        let recorded = self
            .store()
            .persist(task)
            .and_then(|()| self.record_created_event(task));
        if let Err(e) = recorded {
            if let Err(discard_err) = forest.discard_created(&[task.id]) {
                error!(task_id = %task.id, error = %discard_err, "failed to discard unrecorded task");
            }
            return Err(e);
        }
        Ok(())
    }

    fn record_created_event(&self, task: &Task) -> Result<()> {
        self.events().append(Event::for_task(
            task,
            EventKind::TaskCreated {
                parent_id: task.parent_id,
                instruction: task.instruction.clone(),
            },
        ))?;
        Ok(())
    }

    /// Spawn every requested child and move the parent to WAITING_SUBTASKS
    /// in one critical section, releasing the parent's slot.
    ///
    /// Spawning is all or nothing: if any child cannot be created or
    /// recorded, the ones already created are discarded and the parent is
    /// failed before its slot is given back.
    pub fn spawn_and_wait(
        &self,
        running: RunningTask,
        requests: &[SpawnRequest],
    ) -> Result<(Task, Vec<Task>)> {
        let mut forest = self.store().lock();
        let parent_id = running.id();

        let mut children = Vec::with_capacity(requests.len());
        if let Err(e) = self.spawn_all_in(&mut forest, parent_id, requests, &mut children) {
            let created: Vec<TaskId> = children.iter().map(|child| child.id).collect();
            if let Err(discard_err) = forest.discard_created(&created) {
                error!(%parent_id, error = %discard_err, "failed to discard partial spawn");
            }
            let message = format!("spawn failed: {}", e);
            if let Err(fail_err) =
                running.finish_in(&self.machine, &mut forest, Transition::fail(&message))
            {
                debug!(%parent_id, error = %fail_err, "parent not failed");
            }
            return Err(e);
        }

        let parent = running.finish_in(
            &self.machine,
            &mut forest,
            Transition::to(TaskStatus::WaitingSubtasks),
        )?;
        info!(%parent_id, children = children.len(), "waiting on subtasks");
        Ok((parent, children))
    }

    /// Create and record every child. Each child is pushed onto `children`
    /// as soon as it exists in the forest.
    fn spawn_all_in(
        &self,
        forest: &mut TaskForest,
        parent_id: TaskId,
        requests: &[SpawnRequest],
        children: &mut Vec<Task>,
    ) -> Result<()> {
        if requests.is_empty() {
            return Err(Error::Validation(format!(
                "task {} requested a spawn with no subtasks",
                parent_id
            )));
        }

        for request in requests {
            let child =
                forest.create_child(parent_id, &request.instruction, request.agent_hint.clone())?;
            children.push(child);
        }
        for child in children.iter() {
            self.store().persist(child)?;
        }
        for child in children.iter() {
            self.record_created_event(child)?;
            debug!(%parent_id, child_id = %child.id, "child spawned");
        }
        Ok(())
    }

    /// Re-check the parent of a child that just resolved.
    ///
    /// The parent moves to EVALUATING if it is waiting and every child is
    /// resolved. Returns `None` when there is nothing to do, including when
    /// the parent was already promoted.
    pub fn on_child_resolved(&self, child_id: TaskId) -> Result<Option<Promotion>> {
        let mut forest = self.store().lock();
        let parent_id = forest
            .get(child_id)
            .ok_or(Error::UnknownTask(child_id))?
            .parent_id;
        match parent_id {
            Some(parent_id) => self.promote_in(&mut forest, parent_id),
            None => Ok(None),
        }
    }

    fn promote_in(&self, forest: &mut TaskForest, parent_id: TaskId) -> Result<Option<Promotion>> {
        let parent = forest.get(parent_id).ok_or(Error::UnknownTask(parent_id))?;
        if parent.status != TaskStatus::WaitingSubtasks {
            return Ok(None);
        }
        if !forest.all_children_resolved(parent_id) {
            return Ok(None);
        }

        let children = forest.child_outcomes(parent_id);
        let mut parent = self.machine.apply_in(
            forest,
            parent_id,
            Transition::to(TaskStatus::Evaluating),
        )?;
        info!(%parent_id, children = children.len(), "subtasks resolved, parent evaluating");

        if self.policy == ChildFailurePolicy::FailParent {
            if let Some(failed) = children.iter().find(|child| child.is_failure()) {
                let message = format!(
                    "child task {} failed: {}",
                    failed.task_id,
                    failed.error.as_deref().unwrap_or("unknown error")
                );
                parent = self
                    .machine
                    .apply_in(forest, parent_id, Transition::fail(&message))?;
            }
        }

        Ok(Some(Promotion { parent, children }))
    }

    pub fn tree(&self, tree_id: TreeId) -> Result<Vec<Task>> {
        self.store().tree(tree_id).ok_or(Error::UnknownTree(tree_id))
    }

    pub fn tree_status(&self, tree_id: TreeId) -> Result<TreeStatus> {
        self.store()
            .tree_status(tree_id)
            .ok_or(Error::UnknownTree(tree_id))
    }

    pub fn summaries(&self) -> Vec<TreeSummary> {
        self.store().summaries()
    }

    /// Every unresolved task of the subtree rooted at `task_id`, including
    /// itself, root first.
    pub fn unresolved_subtree(&self, task_id: TaskId) -> Result<Vec<TaskId>> {
        let forest = self.store().lock();
        let root = forest.get(task_id).ok_or(Error::UnknownTask(task_id))?;
        let mut ids = Vec::new();
        if !root.status.is_resolved() {
            ids.push(task_id);
        }
        ids.extend(
            forest
                .descendants(task_id)
                .into_iter()
                .filter(|id| forest.get(*id).is_some_and(|t| !t.status.is_resolved())),
        );
        Ok(ids)
    }
}
