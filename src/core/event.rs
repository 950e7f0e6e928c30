//! Event model for the per-tree activity log.
//!
//! Events are immutable facts. `EventKind` is a closed enum over every kind
//! the runtime produces, with `Extension` for dispatcher-defined payloads and
//! `Unknown` so older readers tolerate newer journals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::runtime_config::RuntimeConfig;
use crate::core::task::{Task, TaskId, TaskStatus, TreeId};

/// What happened. Serialized inline with the event, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A task was added to a tree.
    TaskCreated {
        parent_id: Option<TaskId>,
        instruction: String,
    },
    /// A lifecycle transition was applied.
    StatusChanged { from: TaskStatus, to: TaskStatus },
    /// A lifecycle transition was requested and refused.
    TransitionRejected {
        from: TaskStatus,
        to: TaskStatus,
        reason: String,
    },
    AgentThinking { content: String },
    ToolCall { tool: String, input: Value },
    ToolResult { tool: String, output: Value },
    AgentError { message: String },
    StepModePause { reason: String },
    StepContinued,
    ConfigUpdated { version: u64, config: RuntimeConfig },
    /// Dispatcher-defined event the runtime carries without interpreting.
    Extension { name: String, data: Value },
    #[serde(other)]
    Unknown,
}

impl EventKind {
    /// Wire name of this kind, as found in the `type` field.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::TaskCreated { .. } => "task_created",
            EventKind::StatusChanged { .. } => "status_changed",
            EventKind::TransitionRejected { .. } => "transition_rejected",
            EventKind::AgentThinking { .. } => "agent_thinking",
            EventKind::ToolCall { .. } => "tool_call",
            EventKind::ToolResult { .. } => "tool_result",
            EventKind::AgentError { .. } => "agent_error",
            EventKind::StepModePause { .. } => "step_mode_pause",
            EventKind::StepContinued => "step_continued",
            EventKind::ConfigUpdated { .. } => "config_updated",
            EventKind::Extension { .. } => "extension",
            EventKind::Unknown => "unknown",
        }
    }
}

/// One entry of the event log.
///
/// `tree_id` is `None` for system events (config updates). `timestamp` and
/// `sequence` are assigned by the log on append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub tree_id: Option<TreeId>,
    pub task_id: Option<TaskId>,
    #[serde(flatten)]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

impl Event {
    /// An event about `task`, carrying its tree and bound agent.
    pub fn for_task(task: &Task, kind: EventKind) -> Self {
        Self {
            tree_id: Some(task.tree_id),
            task_id: Some(task.id),
            kind,
            agent_name: task.agent_name.clone(),
            timestamp: Utc::now(),
            sequence: 0,
        }
    }

    /// A process-wide event with no tree.
    pub fn system(kind: EventKind) -> Self {
        Self {
            tree_id: None,
            task_id: None,
            kind,
            agent_name: None,
            timestamp: Utc::now(),
            sequence: 0,
        }
    }

    pub fn is_system(&self) -> bool {
        self.tree_id.is_none()
    }

    /// The status this event moved its task to, if it is a transition.
    pub fn new_status(&self) -> Option<TaskStatus> {
        match self.kind {
            EventKind::StatusChanged { to, .. } => Some(to),
            _ => None,
        }
    }
}

/// Which events a subscriber wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventFilter {
    /// Restrict to one tree. `None` matches every tree.
    pub tree_id: Option<TreeId>,
    /// Whether system events (no tree) are delivered.
    pub include_system: bool,
}

impl EventFilter {
    /// Everything.
    pub fn all() -> Self {
        Self {
            tree_id: None,
            include_system: true,
        }
    }

    /// One tree plus system events.
    pub fn tree(tree_id: TreeId) -> Self {
        Self {
            tree_id: Some(tree_id),
            include_system: true,
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        match (event.tree_id, self.tree_id) {
            (None, _) => self.include_system,
            (Some(_), None) => true,
            (Some(event_tree), Some(wanted)) => event_tree == wanted,
        }
    }
}
