//! State machine engine.
//!
//! The only code path that changes a task's status. Each accepted transition
//! writes the new record to the journal, emits exactly one `status_changed`
//! event and only then commits the record, all while the store lock is held.
//! If the event cannot be written the record is left as it was. Refused
//! transitions leave the task untouched and are logged as
//! `transition_rejected` events.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error};

use crate::core::event::{Event, EventKind};
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::core::tree::TaskForest;
use crate::error::{Error, Result};
use crate::orchestration::events::EventLog;
use crate::orchestration::limiter::SlotGuard;
use crate::orchestration::store::TaskStore;

/// A requested status change and the data it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub target: TaskStatus,
    pub agent_name: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub review_reason: Option<String>,
}

impl Transition {
    pub fn to(target: TaskStatus) -> Self {
        Self {
            target,
            agent_name: None,
            result: None,
            error: None,
            review_reason: None,
        }
    }

    pub fn select_agent(agent_name: &str) -> Self {
        Self {
            agent_name: Some(agent_name.to_string()),
            ..Self::to(TaskStatus::AgentSelected)
        }
    }

    pub fn complete(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::to(TaskStatus::Complete)
        }
    }

    pub fn fail(error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::to(TaskStatus::Failed)
        }
    }

    pub fn flag(reason: &str) -> Self {
        Self {
            review_reason: Some(reason.to_string()),
            ..Self::to(TaskStatus::ReviewFlagged)
        }
    }
}

#[derive(Clone)]
pub struct StateMachine {
    store: TaskStore,
    events: EventLog,
}

impl StateMachine {
    pub fn new(store: TaskStore, events: EventLog) -> Self {
        Self { store, events }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Apply `transition` to `task_id`, taking the store lock.
    pub fn apply(&self, task_id: TaskId, transition: Transition) -> Result<Task> {
        let mut forest = self.store.lock();
        self.apply_in(&mut forest, task_id, transition)
    }

    /// Apply `transition` with the store lock already held.
    ///
    /// # Errors
    /// - `UnknownTask` if the task does not exist
    /// - `InvalidTransition` if the edge is not legal; a
    ///   `transition_rejected` event is emitted and the task is unchanged
    /// - `Store` / `Io` if the journal or event log cannot be written
    pub fn apply_in(
        &self,
        forest: &mut TaskForest,
        task_id: TaskId,
        transition: Transition,
    ) -> Result<Task> {
        let task = forest.get_mut(task_id).ok_or(Error::UnknownTask(task_id))?;
        let from = task.status;
        let to = transition.target;

        if !from.can_transition_to(to) {
            let rejected = task.clone();
            return Err(self.reject(&rejected, to));
        }

        let mut next = task.clone();
        next.transition(to, Utc::now())?;
        if let Some(agent_name) = transition.agent_name {
            next.agent_name = Some(agent_name);
        }
        match to {
            TaskStatus::Complete => {
                next.record_result(transition.result.unwrap_or(Value::Null))?;
            }
            TaskStatus::Failed => {
                let message = transition.error.unwrap_or_else(|| "unknown error".to_string());
                next.record_error(&message)?;
            }
            TaskStatus::ReviewFlagged => {
                next.review_reason = transition.review_reason;
            }
            _ => {}
        }

        self.store.persist(&next)?;
        let event = Event::for_task(&next, EventKind::StatusChanged { from, to });
        if let Err(err) = self.events.append(event) {
            // The record stays at `from`; put the journal back there too.
            if let Err(restore_err) = self.store.persist(task) {
                error!(%task_id, error = %restore_err, "failed to restore journal snapshot");
            }
            return Err(err);
        }
        *task = next.clone();

        debug!(%task_id, tree_id = %next.tree_id, %from, %to, "transition applied");
        Ok(next)
    }

    fn reject(&self, task: &Task, to: TaskStatus) -> Error {
        let err = Error::InvalidTransition {
            task_id: task.id,
            from: task.status,
            to,
        };
        error!(task_id = %task.id, from = %task.status, %to, "illegal transition rejected");

        let event = Event::for_task(
            task,
            EventKind::TransitionRejected {
                from: task.status,
                to,
                reason: err.to_string(),
            },
        );
        if let Err(append_err) = self.events.append(event) {
            error!(task_id = %task.id, error = %append_err, "failed to record rejected transition");
        }
        err
    }

    /// Move an AGENT_SELECTED task into RUNNING under `slot`.
    ///
    /// The slot travels with the returned token and is released when the
    /// token leaves RUNNING, whichever way it leaves.
    pub fn start_running(&self, task_id: TaskId, slot: SlotGuard) -> Result<RunningTask> {
        let task = self.apply(task_id, Transition::to(TaskStatus::Running))?;
        Ok(RunningTask { task, slot })
    }
}

/// A task in RUNNING together with the slot that lets it be there.
#[derive(Debug)]
pub struct RunningTask {
    task: Task,
    slot: SlotGuard,
}

impl RunningTask {
    /// Snapshot taken when the task entered RUNNING.
    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn id(&self) -> TaskId {
        self.task.id
    }

    /// Leave RUNNING. The slot is released whether or not the transition is
    /// accepted.
    pub fn finish(self, machine: &StateMachine, transition: Transition) -> Result<Task> {
        let RunningTask { task, slot } = self;
        let outcome = machine.apply(task.id, transition);
        drop(slot);
        outcome
    }

    /// Leave RUNNING with the store lock already held.
    pub fn finish_in(
        self,
        machine: &StateMachine,
        forest: &mut TaskForest,
        transition: Transition,
    ) -> Result<Task> {
        let RunningTask { task, slot } = self;
        let outcome = machine.apply_in(forest, task.id, transition);
        drop(slot);
        outcome
    }
}
