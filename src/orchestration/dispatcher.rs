//! Boundary to the code that actually does a task's work.
//!
//! An `AgentDispatcher` executes one RUNNING task and reports a
//! `DispatchOutcome`. A `PostProcessor` drives the fixed
//! EVALUATING -> DOCUMENTING -> SUMMARIZING sequence. Both treat instructions
//! and results as opaque payloads.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::event::{Event, EventKind};
use crate::core::task::Task;
use crate::core::tree::ChildOutcome;
use crate::error::Result;
use crate::orchestration::events::EventLog;

/// Agent bound to tasks that carry no hint.
pub const DEFAULT_AGENT: &str = "default";

/// A child the running task wants created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub instruction: String,
    #[serde(default)]
    pub agent_hint: Option<String>,
}

impl SpawnRequest {
    pub fn new(instruction: &str) -> Self {
        Self {
            instruction: instruction.to_string(),
            agent_hint: None,
        }
    }

    pub fn with_agent(instruction: &str, agent: &str) -> Self {
        Self {
            instruction: instruction.to_string(),
            agent_hint: Some(agent.to_string()),
        }
    }
}

/// How one execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Done, no children.
    Complete { result: Value },
    /// Wait for these children. `interim` is kept for the parent's
    /// evaluation. An empty list counts as `Complete` with the interim output.
    Spawn {
        subtasks: Vec<SpawnRequest>,
        interim: Option<Value>,
    },
    Fail { error: String },
}

/// Something a dispatcher wants observers to see while it works.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatcherEvent {
    Thinking(String),
    ToolCall { tool: String, input: Value },
    ToolResult { tool: String, output: Value },
    Error(String),
    Extension { name: String, data: Value },
}

impl From<DispatcherEvent> for EventKind {
    fn from(event: DispatcherEvent) -> Self {
        match event {
            DispatcherEvent::Thinking(content) => EventKind::AgentThinking { content },
            DispatcherEvent::ToolCall { tool, input } => EventKind::ToolCall { tool, input },
            DispatcherEvent::ToolResult { tool, output } => EventKind::ToolResult { tool, output },
            DispatcherEvent::Error(message) => EventKind::AgentError { message },
            DispatcherEvent::Extension { name, data } => EventKind::Extension { name, data },
        }
    }
}

/// Publishes dispatcher events into the running task's tree.
#[derive(Clone)]
pub struct EventSink {
    task: Task,
    events: EventLog,
}

impl EventSink {
    pub fn new(task: Task, events: EventLog) -> Self {
        Self { task, events }
    }

    pub fn emit(&self, event: DispatcherEvent) -> Result<()> {
        self.events
            .append(Event::for_task(&self.task, event.into()))
            .map(|_| ())
    }
}

/// Everything a dispatcher gets for one execution.
pub struct DispatchContext {
    /// Snapshot of the task as it entered RUNNING.
    pub task: Task,
    pub sink: EventSink,
}

#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    /// Agent for tasks without a hint.
    fn default_agent(&self) -> &str {
        DEFAULT_AGENT
    }

    /// Bind an executor identity to `task`.
    fn select_agent(&self, task: &Task) -> String {
        task.agent_hint
            .clone()
            .unwrap_or_else(|| self.default_agent().to_string())
    }

    /// Run one task to an outcome. Cancelled by dropping the future.
    async fn execute(&self, ctx: DispatchContext) -> DispatchOutcome;
}

/// Verdict of an evaluation or documentation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    Flag { reason: String },
    Fail { error: String },
}

/// Input to post-processing.
#[derive(Debug, Clone)]
pub struct EvaluationInput {
    pub task: Task,
    /// What the task itself produced (its result, or interim output when it
    /// spawned children).
    pub output: Option<Value>,
    /// Resolved children, empty for leaf tasks.
    pub children: Vec<ChildOutcome>,
}

impl EvaluationInput {
    pub fn failed_children(&self) -> impl Iterator<Item = &ChildOutcome> {
        self.children.iter().filter(|child| child.is_failure())
    }
}

#[async_trait]
pub trait PostProcessor: Send + Sync {
    async fn evaluate(&self, _input: &EvaluationInput) -> Verdict {
        Verdict::Proceed
    }

    async fn document(&self, _input: &EvaluationInput) -> Verdict {
        Verdict::Proceed
    }

    /// Produce the task's final result.
    async fn summarize(&self, input: &EvaluationInput) -> std::result::Result<Value, String>;
}

/// Proceeds through every step. A leaf's result is its own output; a parent's
/// result aggregates its output and its children's outcomes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

#[async_trait]
impl PostProcessor for PassThrough {
    async fn summarize(&self, input: &EvaluationInput) -> std::result::Result<Value, String> {
        if input.children.is_empty() {
            return Ok(input.output.clone().unwrap_or(Value::Null));
        }
        let children = serde_json::to_value(&input.children).map_err(|e| e.to_string())?;
        Ok(json!({
            "output": input.output,
            "children": children,
        }))
    }
}

/// Completes every task with its own instruction.
#[derive(Debug, Clone, Default)]
pub struct EchoDispatcher;

#[async_trait]
impl AgentDispatcher for EchoDispatcher {
    async fn execute(&self, ctx: DispatchContext) -> DispatchOutcome {
        DispatchOutcome::Complete {
            result: json!({ "echo": ctx.task.instruction }),
        }
    }
}
