//! Task data model and lifecycle edge table.
//!
//! Tasks are the nodes of a task tree. Each task tracks its tree membership,
//! lifecycle status, bound agent, timing, and its final outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Unique, monotonically assigned task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Identifier of an isolated task tree.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TreeId(pub Uuid);

impl TreeId {
    /// Create a new unique tree identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TreeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TreeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TreeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task status in its lifecycle.
///
/// `Complete` and `Failed` are terminal. `ReviewFlagged` is not terminal but
/// counts as resolved: it holds no slot and unblocks a waiting parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Created,
    Queued,
    AgentSelected,
    Running,
    WaitingSubtasks,
    Evaluating,
    Documenting,
    Summarizing,
    Complete,
    Failed,
    ReviewFlagged,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 11] = [
        TaskStatus::Created,
        TaskStatus::Queued,
        TaskStatus::AgentSelected,
        TaskStatus::Running,
        TaskStatus::WaitingSubtasks,
        TaskStatus::Evaluating,
        TaskStatus::Documenting,
        TaskStatus::Summarizing,
        TaskStatus::Complete,
        TaskStatus::Failed,
        TaskStatus::ReviewFlagged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "CREATED",
            TaskStatus::Queued => "QUEUED",
            TaskStatus::AgentSelected => "AGENT_SELECTED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::WaitingSubtasks => "WAITING_SUBTASKS",
            TaskStatus::Evaluating => "EVALUATING",
            TaskStatus::Documenting => "DOCUMENTING",
            TaskStatus::Summarizing => "SUMMARIZING",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Failed => "FAILED",
            TaskStatus::ReviewFlagged => "REVIEW_FLAGGED",
        }
    }

    /// `Complete` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }

    /// Terminal, or flagged for review. A parent waits only on unresolved children.
    pub fn is_resolved(&self) -> bool {
        self.is_terminal() || *self == TaskStatus::ReviewFlagged
    }

    /// Check whether `self -> target` is a legal lifecycle edge.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        if target == ReviewFlagged {
            return !self.is_resolved();
        }

        matches!(
            (*self, target),
            (Created, Queued)
                | (Queued, AgentSelected)
                | (AgentSelected, Running)
                | (Running, WaitingSubtasks)
                | (Running, Evaluating)
                | (WaitingSubtasks, Evaluating)
                | (Evaluating, Documenting)
                | (Documenting, Summarizing)
                | (Summarizing, Complete)
                | (Running, Failed)
                | (Evaluating, Failed)
                | (Documenting, Failed)
                | (Summarizing, Failed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordering hint for a task. Carried, not interpreted by admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// A single node of a task tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// The tree this task belongs to. Never changes.
    pub tree_id: TreeId,
    /// Parent task, `None` only for tree roots.
    pub parent_id: Option<TaskId>,
    /// Executor identity, bound when the task becomes AGENT_SELECTED.
    pub agent_name: Option<String>,
    /// Executor requested by the spawning parent, if any.
    #[serde(default)]
    pub agent_hint: Option<String>,
    /// Opaque instruction payload.
    pub instruction: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Output recorded on COMPLETE.
    pub result: Option<Value>,
    /// Error recorded on FAILED.
    pub error: Option<String>,
    /// Why the task was flagged for review.
    #[serde(default)]
    pub review_reason: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create the root task of a new tree.
    pub fn root(id: TaskId, tree_id: TreeId, instruction: &str, priority: Priority) -> Self {
        Self {
            id,
            tree_id,
            parent_id: None,
            agent_name: None,
            agent_hint: None,
            instruction: instruction.to_string(),
            status: TaskStatus::Created,
            result: None,
            error: None,
            review_reason: None,
            priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Create a child of `parent` in the same tree.
    pub fn child(id: TaskId, parent: &Task, instruction: &str, agent_hint: Option<String>) -> Self {
        Self {
            parent_id: Some(parent.id),
            agent_hint,
            priority: parent.priority,
            ..Self::root(id, parent.tree_id, instruction, parent.priority)
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Move to `target`, stamping timestamps.
    ///
    /// Timestamps never go backwards relative to earlier ones on this task.
    pub fn transition(&mut self, target: TaskStatus, now: DateTime<Utc>) -> Result<TaskStatus> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidTransition {
                task_id: self.id,
                from: self.status,
                to: target,
            });
        }

        let now = now.max(self.latest_timestamp());
        if target == TaskStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if target.is_resolved() {
            self.completed_at = Some(now);
        }

        let previous = self.status;
        self.status = target;
        Ok(previous)
    }

    /// Record the success payload. Only once, and only on COMPLETE.
    pub fn record_result(&mut self, result: Value) -> Result<()> {
        self.ensure_outcome_writable(TaskStatus::Complete)?;
        self.result = Some(result);
        Ok(())
    }

    /// Record the failure payload. Only once, and only on FAILED.
    pub fn record_error(&mut self, error: &str) -> Result<()> {
        self.ensure_outcome_writable(TaskStatus::Failed)?;
        self.error = Some(error.to_string());
        Ok(())
    }

    fn ensure_outcome_writable(&self, expected: TaskStatus) -> Result<()> {
        if self.result.is_some() || self.error.is_some() {
            return Err(Error::OutcomeAlreadyRecorded { task_id: self.id });
        }
        if self.status != expected {
            return Err(Error::Validation(format!(
                "task {} is {}, outcome requires {}",
                self.id, self.status, expected
            )));
        }
        Ok(())
    }

    /// Most recent timestamp recorded on this task.
    pub fn latest_timestamp(&self) -> DateTime<Utc> {
        [self.started_at, self.completed_at]
            .into_iter()
            .flatten()
            .fold(self.created_at, |latest, ts| latest.max(ts))
    }
}
