//! External-process agent dispatcher.
//!
//! `CommandDispatcher` runs a configured command once per task, with the
//! instruction as its final argument, and reads JSON lines from its stdout:
//!
//! ```text
//! {"type": "thinking", "content": "..."}
//! {"type": "tool_call", "tool": "grep", "input": {...}}
//! {"type": "tool_result", "tool": "grep", "output": {...}}
//! {"type": "error", "message": "..."}
//! {"type": "event", "name": "...", "data": {...}}
//! {"type": "result", "result": ...}
//! {"type": "spawn", "subtasks": [{"instruction": "...", "agent_hint": "..."}], "interim": ...}
//! ```
//!
//! Lines that are not JSON are treated as thinking text.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::orchestration::dispatcher::{
    AgentDispatcher, DispatchContext, DispatchOutcome, DispatcherEvent, SpawnRequest,
    DEFAULT_AGENT,
};

/// Default timeout for one agent execution (10 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// One line of agent output.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentLine {
    Thinking {
        content: String,
    },
    ToolCall {
        tool: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool: String,
        #[serde(default)]
        output: Value,
    },
    Error {
        message: String,
    },
    Event {
        name: String,
        #[serde(default)]
        data: Value,
    },
    #[serde(rename = "result")]
    Final {
        #[serde(default)]
        result: Value,
    },
    Spawn {
        subtasks: Vec<SpawnRequest>,
        #[serde(default)]
        interim: Option<Value>,
    },
}

/// Parse one stdout line. `None` for blank lines.
pub fn parse_line(line: &str) -> Option<AgentLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str(trimmed) {
        Ok(parsed) => Some(parsed),
        Err(_) => Some(AgentLine::Thinking {
            content: trimmed.to_string(),
        }),
    }
}

/// Runs an external command per task.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    default_agent: String,
}

impl CommandDispatcher {
    pub fn new(program: &str, args: Vec<String>) -> Self {
        Self {
            program: program.to_string(),
            args,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            default_agent: DEFAULT_AGENT.to_string(),
        }
    }

    /// Build from a whitespace-separated command line.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the command line is empty.
    pub fn from_command_line(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| Error::InvalidConfig("agent command is empty".to_string()))?;
        Ok(Self::new(&program, parts.collect()))
    }

    /// Set a custom timeout for one execution.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_default_agent(mut self, agent: &str) -> Self {
        self.default_agent = agent.to_string();
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self, ctx: &DispatchContext) -> Result<DispatchOutcome> {
        let task = &ctx.task;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&task.instruction)
            .env("CANOPY_TASK_ID", task.id.to_string())
            .env("CANOPY_TREE_ID", task.tree_id.to_string())
            .env(
                "CANOPY_AGENT",
                task.agent_name.as_deref().unwrap_or(&self.default_agent),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::DispatcherFailure("agent stdout unavailable".to_string()))?;
        let stderr = child.stderr.take();
        let stderr_reader = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        let mut outcome = None;
        let mut plain_output = Vec::new();
        let mut last_error = None;
        let mut lines = BufReader::new(stdout).lines();

        while let Some(line) = lines.next_line().await? {
            let Some(parsed) = parse_line(&line) else {
                continue;
            };
            let event = match parsed {
                AgentLine::Final { result } => {
                    outcome = Some(DispatchOutcome::Complete { result });
                    continue;
                }
                AgentLine::Spawn { subtasks, interim } => {
                    outcome = Some(DispatchOutcome::Spawn { subtasks, interim });
                    continue;
                }
                AgentLine::Thinking { content } => {
                    if serde_json::from_str::<Value>(line.trim()).is_err() {
                        plain_output.push(content.clone());
                    }
                    DispatcherEvent::Thinking(content)
                }
                AgentLine::ToolCall { tool, input } => DispatcherEvent::ToolCall { tool, input },
                AgentLine::ToolResult { tool, output } => {
                    DispatcherEvent::ToolResult { tool, output }
                }
                AgentLine::Error { message } => {
                    last_error = Some(message.clone());
                    DispatcherEvent::Error(message)
                }
                AgentLine::Event { name, data } => DispatcherEvent::Extension { name, data },
            };
            if let Err(e) = ctx.sink.emit(event) {
                warn!(task_id = %task.id, error = %e, "failed to record agent event");
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_reader.await.unwrap_or_default();
        debug!(task_id = %task.id, exit = ?status.code(), "agent process exited");

        if let Some(outcome) = outcome {
            return Ok(outcome);
        }

        if !status.success() {
            let error = if !stderr.trim().is_empty() {
                stderr.trim().to_string()
            } else if let Some(message) = last_error {
                message
            } else {
                format!(
                    "agent exited with code {}",
                    status.code().unwrap_or(-1)
                )
            };
            return Ok(DispatchOutcome::Fail { error });
        }

        Ok(DispatchOutcome::Complete {
            result: Value::String(plain_output.join("\n")),
        })
    }
}

#[async_trait]
impl AgentDispatcher for CommandDispatcher {
    fn default_agent(&self) -> &str {
        &self.default_agent
    }

    async fn execute(&self, ctx: DispatchContext) -> DispatchOutcome {
        match tokio::time::timeout(self.timeout, self.run(&ctx)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => DispatchOutcome::Fail {
                error: Error::DispatcherFailure(e.to_string()).to_string(),
            },
            Err(_) => DispatchOutcome::Fail {
                error: Error::Timeout(self.timeout).to_string(),
            },
        }
    }
}
