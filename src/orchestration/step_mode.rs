//! Step-mode gate in front of RUNNING.
//!
//! Whether a task must stop is a pure question about the runtime config. A
//! task that stops registers a `PausedTask` and waits on a one-shot signal
//! that only `continue_task` (or cancellation) can fire.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::core::event::{Event, EventKind};
use crate::core::runtime_config::RuntimeConfig;
use crate::core::task::{Task, TaskId, TreeId};
use crate::error::Result;
use crate::orchestration::events::EventLog;

/// A task held at the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PausedTask {
    pub task_id: TaskId,
    pub tree_id: TreeId,
    pub reason: String,
}

struct PauseEntry {
    paused: PausedTask,
    agent_name: Option<String>,
    resume: oneshot::Sender<()>,
}

/// Returned by `pause`; resolves when the task may run.
#[derive(Debug)]
pub struct PauseHandle {
    task_id: TaskId,
    resume: oneshot::Receiver<()>,
}

impl PauseHandle {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Wait for the continue signal. `false` if the pause was cancelled.
    pub async fn wait(self) -> bool {
        self.resume.await.is_ok()
    }
}

pub struct StepModeController {
    paused: Mutex<HashMap<TaskId, PauseEntry>>,
    events: EventLog,
}

impl StepModeController {
    pub fn new(events: EventLog) -> Self {
        Self {
            paused: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, PauseEntry>> {
        self.paused.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether tasks of `tree_id` stop before running under `config`.
    pub fn should_pause(config: &RuntimeConfig, tree_id: TreeId) -> bool {
        config.step_mode_for(tree_id)
    }

    /// Hold `task` at the gate and emit `step_mode_pause`.
    pub fn pause(&self, task: &Task, reason: &str) -> Result<PauseHandle> {
        let mut paused = self.lock();
        self.events.append(Event::for_task(
            task,
            EventKind::StepModePause {
                reason: reason.to_string(),
            },
        ))?;

        let (resume, receiver) = oneshot::channel();
        paused.insert(
            task.id,
            PauseEntry {
                paused: PausedTask {
                    task_id: task.id,
                    tree_id: task.tree_id,
                    reason: reason.to_string(),
                },
                agent_name: task.agent_name.clone(),
                resume,
            },
        );
        info!(task_id = %task.id, tree_id = %task.tree_id, reason, "task paused at step gate");

        Ok(PauseHandle {
            task_id: task.id,
            resume: receiver,
        })
    }

    /// Release a paused task, emitting `step_continued`.
    ///
    /// Returns `false`, with no event, when nothing is paused under
    /// `task_id`. A repeated continue is therefore harmless.
    pub fn continue_task(&self, task_id: TaskId) -> Result<bool> {
        let mut paused = self.lock();
        let Some(entry) = paused.get(&task_id) else {
            debug!(%task_id, "continue ignored, task not paused");
            return Ok(false);
        };

        self.events.append(Event {
            tree_id: Some(entry.paused.tree_id),
            task_id: Some(task_id),
            agent_name: entry.agent_name.clone(),
            ..Event::system(EventKind::StepContinued)
        })?;

        if let Some(entry) = paused.remove(&task_id) {
            info!(%task_id, "task continued");
            let _ = entry.resume.send(());
        }
        Ok(true)
    }

    /// Drop a pause without continuing; the waiter sees `false`.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        self.lock().remove(&task_id).is_some()
    }

    /// Every paused task, ordered by id.
    pub fn paused(&self) -> Vec<PausedTask> {
        let mut paused: Vec<PausedTask> = self
            .lock()
            .values()
            .map(|entry| entry.paused.clone())
            .collect();
        paused.sort_by_key(|p| p.task_id);
        paused
    }

    /// Continue every paused task whose tree is no longer gated by `config`.
    pub fn release_ungated(&self, config: &RuntimeConfig) -> Result<Vec<TaskId>> {
        let ungated: Vec<TaskId> = self
            .paused()
            .into_iter()
            .filter(|p| !Self::should_pause(config, p.tree_id))
            .map(|p| p.task_id)
            .collect();

        let mut released = Vec::new();
        for task_id in ungated {
            if self.continue_task(task_id)? {
                released.push(task_id);
            }
        }
        Ok(released)
    }
}
