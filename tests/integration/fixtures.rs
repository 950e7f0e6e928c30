//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted dispatcher whose outcome per instruction is set by the test
//! - Gates that hold an execution until the test releases it
//! - An orchestrator harness with event inspection helpers

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use canopy::core::{Event, EventKind, RuntimeConfig, TaskId, TaskStatus, TreeId};
use canopy::orchestration::{
    AgentDispatcher, ChildFailurePolicy, DispatchContext, DispatchOutcome, DispatcherEvent,
    Orchestrator, RuntimeParts, SpawnRequest,
};

/// Upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// What the scripted dispatcher does for one instruction.
#[derive(Debug, Clone)]
pub enum Script {
    Complete(Value),
    Spawn(Vec<SpawnRequest>, Option<Value>),
    Fail(String),
}

/// Decrements the running counter however the execution ends.
struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Dispatcher driven by per-instruction scripts.
///
/// Unknown instructions complete with `{"done": instruction}`. A held
/// instruction blocks inside `execute` until `release` is called for it.
#[derive(Default)]
pub struct ScriptedDispatcher {
    scripts: Mutex<HashMap<String, Script>>,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    executed: Mutex<Vec<String>>,
}

impl ScriptedDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, instruction: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(instruction.to_string(), script);
    }

    /// Block executions of `instruction` until released.
    pub fn hold(&self, instruction: &str) {
        self.gates
            .lock()
            .unwrap()
            .insert(instruction.to_string(), Arc::new(Semaphore::new(0)));
    }

    /// Let one held execution of `instruction` finish.
    pub fn release(&self, instruction: &str) {
        if let Some(gate) = self.gates.lock().unwrap().get(instruction) {
            gate.add_permits(1);
        }
    }

    /// Executions currently inside `execute`.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent executions seen.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Instructions in the order their executions started.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentDispatcher for ScriptedDispatcher {
    async fn execute(&self, ctx: DispatchContext) -> DispatchOutcome {
        let instruction = ctx.task.instruction.clone();
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let _guard = RunningGuard(&self.running);
        self.executed.lock().unwrap().push(instruction.clone());

        let _ = ctx
            .sink
            .emit(DispatcherEvent::Thinking(format!("working on {}", instruction)));

        let gate = self.gates.lock().unwrap().get(&instruction).cloned();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let script = self.scripts.lock().unwrap().get(&instruction).cloned();
        match script {
            Some(Script::Complete(result)) => DispatchOutcome::Complete { result },
            Some(Script::Spawn(subtasks, interim)) => DispatchOutcome::Spawn { subtasks, interim },
            Some(Script::Fail(error)) => DispatchOutcome::Fail { error },
            None => DispatchOutcome::Complete {
                result: json!({ "done": instruction }),
            },
        }
    }
}

/// An in-memory orchestrator over a scripted dispatcher.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub dispatcher: Arc<ScriptedDispatcher>,
}

impl Harness {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_policy(config, ChildFailurePolicy::ParentDecides)
    }

    pub fn with_policy(config: RuntimeConfig, policy: ChildFailurePolicy) -> Self {
        let dispatcher = ScriptedDispatcher::new();
        let parts = RuntimeParts::in_memory(config, dispatcher.clone())
            .expect("valid config")
            .with_child_failure_policy(policy);
        Self {
            orchestrator: Orchestrator::new(parts),
            dispatcher,
        }
    }

    pub fn events(&self, tree_id: TreeId) -> Vec<Event> {
        self.orchestrator.replay(tree_id, 0).expect("known tree")
    }

    /// Statuses `task_id` moved through, in order.
    pub fn statuses(&self, tree_id: TreeId, task_id: TaskId) -> Vec<TaskStatus> {
        self.events(tree_id)
            .iter()
            .filter(|event| event.task_id == Some(task_id))
            .filter_map(Event::new_status)
            .collect()
    }

    /// Wire names of `task_id`'s events, in order.
    pub fn kinds(&self, tree_id: TreeId, task_id: TaskId) -> Vec<&'static str> {
        self.events(tree_id)
            .iter()
            .filter(|event| event.task_id == Some(task_id))
            .map(|event| event.kind.name())
            .collect()
    }

    pub fn status(&self, task_id: TaskId) -> TaskStatus {
        self.orchestrator.task(task_id).expect("known task").status
    }

    pub async fn wait_for(&self, task_id: TaskId, status: TaskStatus) {
        within(self.orchestrator.wait_for_status(task_id, status))
            .await
            .expect("wait failed");
    }

    /// Wait until `task_id` sits at the step gate.
    pub async fn wait_paused(&self, task_id: TaskId) {
        eventually(|| {
            self.orchestrator
                .paused()
                .iter()
                .any(|paused| paused.task_id == task_id)
        })
        .await;
    }
}

/// Position of the first event matching `predicate`.
pub fn position(events: &[Event], predicate: impl Fn(&Event) -> bool) -> Option<usize> {
    events.iter().position(predicate)
}

pub fn is_status(task_id: TaskId, status: TaskStatus) -> impl Fn(&Event) -> bool {
    move |event| event.task_id == Some(task_id) && event.new_status() == Some(status)
}

pub fn is_kind(task_id: TaskId, name: &'static str) -> impl Fn(&Event) -> bool {
    move |event| event.task_id == Some(task_id) && event.kind.name() == name
}

pub fn is_pause(event: &Event) -> bool {
    matches!(event.kind, EventKind::StepModePause { .. })
}

/// Fail the test if `future` takes longer than `TEST_TIMEOUT`.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("timed out")
}

/// Poll `condition` until it holds.
pub async fn eventually(condition: impl Fn() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

/// Give drivers a chance to make progress they should not make.
pub async fn settle_briefly() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn config(max_parallel_tasks: usize, step_mode: bool) -> RuntimeConfig {
    RuntimeConfig {
        max_parallel_tasks,
        step_mode,
        ..Default::default()
    }
}
