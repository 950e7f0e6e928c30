//! Orchestrator: wires the runtime components together and drives tasks.
//!
//! Every task gets a driver on the tokio runtime that walks it from CREATED
//! to RUNNING (slot, agent, step gate), hands it to the dispatcher and acts
//! on the outcome. Parents that spawned children are finished later by
//! whichever child resolves last. Each task owns a child cancellation token
//! of the orchestrator's shutdown token; flagging a task cancels its token.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::event::{Event, EventFilter, EventKind};
use crate::core::runtime_config::{RuntimeConfig, VersionedConfig};
use crate::core::task::{Priority, Task, TaskId, TaskStatus, TreeId};
use crate::core::tree::{ChildOutcome, TaskForest, TreeStatus, TreeSummary};
use crate::error::{Error, Result};
use crate::orchestration::config_service::ConfigService;
use crate::orchestration::dispatcher::{
    AgentDispatcher, DispatchContext, DispatchOutcome, EvaluationInput, EventSink, PassThrough,
    PostProcessor, Verdict,
};
use crate::orchestration::events::{EventLog, Subscription};
use crate::orchestration::limiter::{ConcurrencyLimiter, SlotGuard};
use crate::orchestration::machine::{StateMachine, Transition};
use crate::orchestration::resolver::{ChildFailurePolicy, TreeManager};
use crate::orchestration::step_mode::{PausedTask, StepModeController};
use crate::orchestration::store::TaskStore;
use crate::state::Journal;

/// Reason recorded on tasks found unresolved after a restart.
pub const INTERRUPTED_REASON: &str = "interrupted by restart";

/// Identifiers of a newly submitted tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub tree_id: TreeId,
    pub task_id: TaskId,
}

/// Result of a continue request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinueOutcome {
    /// The task was paused and now proceeds.
    Resumed,
    /// The task exists but was not paused. Nothing happened.
    NotPaused,
    /// No such task. Nothing happened.
    UnknownTask,
}

/// How far a review flag reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagScope {
    /// Only the named task. Its descendants keep running.
    #[default]
    Task,
    /// The named task and every unresolved descendant, within its tree.
    Subtree,
}

/// Everything an orchestrator is built from.
pub struct RuntimeParts {
    pub store: TaskStore,
    pub events: EventLog,
    pub config: ConfigService,
    pub dispatcher: Arc<dyn AgentDispatcher>,
    pub post_processor: Arc<dyn PostProcessor>,
    pub child_failure_policy: ChildFailurePolicy,
}

impl RuntimeParts {
    /// In-memory parts with the pass-through post-processor.
    pub fn in_memory(config: RuntimeConfig, dispatcher: Arc<dyn AgentDispatcher>) -> Result<Self> {
        let events = EventLog::new();
        Ok(Self {
            store: TaskStore::new(),
            config: ConfigService::new(config, events.clone())?,
            events,
            dispatcher,
            post_processor: Arc::new(PassThrough),
            child_failure_policy: ChildFailurePolicy::default(),
        })
    }

    /// Parts rebuilt from the journal in `data_dir`.
    ///
    /// The runtime config persisted in `data_dir` wins over `fallback`.
    pub fn load(
        data_dir: &Path,
        fallback: RuntimeConfig,
        dispatcher: Arc<dyn AgentDispatcher>,
    ) -> Result<Self> {
        let journal = Arc::new(Journal::open(data_dir)?);
        let contents = journal.load()?;

        let mut forest = TaskForest::new();
        let task_count = contents.tasks.len();
        for task in contents.tasks {
            forest.insert_restored(task)?;
        }
        forest.validate()?;

        let events = EventLog::with_journal(journal.clone());
        let event_count = contents.events.len();
        events.restore(contents.events);
        info!(tasks = task_count, events = event_count, "journal loaded");

        let config = ConfigService::load(&data_dir.join("runtime.toml"), fallback, events.clone())?;
        Ok(Self {
            store: TaskStore::with_journal(forest, journal),
            events,
            config,
            dispatcher,
            post_processor: Arc::new(PassThrough),
            child_failure_policy: ChildFailurePolicy::default(),
        })
    }

    pub fn with_post_processor(mut self, post_processor: Arc<dyn PostProcessor>) -> Self {
        self.post_processor = post_processor;
        self
    }

    pub fn with_child_failure_policy(mut self, policy: ChildFailurePolicy) -> Self {
        self.child_failure_policy = policy;
        self
    }
}

struct Inner {
    machine: StateMachine,
    trees: TreeManager,
    events: EventLog,
    limiter: ConcurrencyLimiter,
    step_mode: StepModeController,
    config: ConfigService,
    dispatcher: Arc<dyn AgentDispatcher>,
    post_processor: Arc<dyn PostProcessor>,
    shutdown: CancellationToken,
    /// Cancellation token of every unresolved task with a live driver or
    /// pending post-processing.
    active: Mutex<HashMap<TaskId, CancellationToken>>,
    /// Output reported alongside a spawn, kept for the parent's evaluation.
    interim: Mutex<HashMap<TaskId, Value>>,
}

/// Handle to the runtime. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Orchestrator {
    pub fn new(parts: RuntimeParts) -> Self {
        let machine = StateMachine::new(parts.store, parts.events.clone());
        let limit = parts.config.current().config.max_parallel_tasks;
        Self {
            inner: Arc::new(Inner {
                trees: TreeManager::new(machine.clone(), parts.child_failure_policy),
                machine,
                step_mode: StepModeController::new(parts.events.clone()),
                events: parts.events,
                limiter: ConcurrencyLimiter::new(limit),
                config: parts.config,
                dispatcher: parts.dispatcher,
                post_processor: parts.post_processor,
                shutdown: CancellationToken::new(),
                active: Mutex::new(HashMap::new()),
                interim: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn store(&self) -> &TaskStore {
        self.inner.machine.store()
    }

    /// Flag every task left unresolved by a previous process.
    ///
    /// Their executors did not survive, so nothing would ever move them.
    pub fn recover_interrupted(&self) -> Result<Vec<TaskId>> {
        let mut forest = self.store().lock();
        let mut stranded: Vec<TaskId> = forest
            .tasks()
            .filter(|task| !task.status.is_resolved())
            .map(|task| task.id)
            .collect();
        stranded.sort();

        for &task_id in &stranded {
            self.inner
                .machine
                .apply_in(&mut forest, task_id, Transition::flag(INTERRUPTED_REASON))?;
        }
        if !stranded.is_empty() {
            warn!(count = stranded.len(), "flagged tasks interrupted by restart");
        }
        Ok(stranded)
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Create a new tree for `instruction` and start driving its root.
    pub fn submit(&self, instruction: &str) -> Result<Submission> {
        self.submit_with_priority(instruction, Priority::Normal)
    }

    pub fn submit_with_priority(&self, instruction: &str, priority: Priority) -> Result<Submission> {
        if instruction.trim().is_empty() {
            return Err(Error::Validation("instruction must not be empty".to_string()));
        }
        let root = self.inner.trees.create_tree(instruction, priority)?;
        self.launch(root.id);
        Ok(Submission {
            tree_id: root.tree_id,
            task_id: root.id,
        })
    }

    /// Release a task held at the step gate. Never an error for tasks that
    /// are unknown or not paused.
    pub fn continue_task(&self, task_id: TaskId) -> Result<ContinueOutcome> {
        if self.store().get(task_id).is_none() {
            debug!(%task_id, "continue for unknown task ignored");
            return Ok(ContinueOutcome::UnknownTask);
        }
        if self.inner.step_mode.continue_task(task_id)? {
            Ok(ContinueOutcome::Resumed)
        } else {
            Ok(ContinueOutcome::NotPaused)
        }
    }

    /// Move a task (or its whole unresolved subtree) to REVIEW_FLAGGED.
    ///
    /// Flagged tasks stop: once the flag is recorded their drivers are
    /// cancelled, releasing any slot, and a pending pause is dropped without
    /// `step_continued`. The flagged
    /// task's parent sees it as a resolved child. Other trees are never
    /// touched. Returns the ids that were flagged.
    ///
    /// # Errors
    /// - `UnknownTask` if the task does not exist
    /// - `InvalidTransition` if the task is already resolved
    pub fn flag_for_review(
        &self,
        task_id: TaskId,
        reason: &str,
        scope: FlagScope,
    ) -> Result<Vec<TaskId>> {
        let targets = match scope {
            FlagScope::Task => vec![task_id],
            FlagScope::Subtree => {
                let targets = self.inner.trees.unresolved_subtree(task_id)?;
                if targets.is_empty() {
                    vec![task_id]
                } else {
                    targets
                }
            }
        };

        let mut flagged = Vec::with_capacity(targets.len());
        for (index, target) in targets.into_iter().enumerate() {
            // The task leaves RUNNING before its driver can drop the slot.
            match self.inner.machine.apply(target, Transition::flag(reason)) {
                Ok(_) => {
                    self.inner.step_mode.cancel(target);
                    if let Some(token) = lock(&self.inner.active).remove(&target) {
                        token.cancel();
                    }
                    info!(task_id = %target, reason, "task flagged for review");
                    flagged.push(target);
                    self.on_resolved(target);
                }
                // Descendants may resolve on their own while we work down.
                Err(Error::InvalidTransition { .. }) if index > 0 => {}
                Err(e) => return Err(e),
            }
        }
        Ok(flagged)
    }

    /// Replace the runtime config and apply it: the limiter adopts the new
    /// limit and tasks paused in trees that are no longer gated continue.
    pub fn update_config(&self, config: RuntimeConfig) -> Result<Arc<VersionedConfig>> {
        self.inner.config.replace(config, |updated| {
            self.inner
                .limiter
                .set_limit(updated.config.max_parallel_tasks);
            let released = self.inner.step_mode.release_ungated(&updated.config)?;
            if !released.is_empty() {
                info!(count = released.len(), "released tasks no longer gated");
            }
            Ok(())
        })
    }

    /// Stop every driver. Unresolved tasks stay where they are.
    pub fn shutdown(&self) {
        info!("orchestrator shutting down");
        self.inner.shutdown.cancel();
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn config(&self) -> Arc<VersionedConfig> {
        self.inner.config.current()
    }

    pub fn task(&self, task_id: TaskId) -> Option<Task> {
        self.store().get(task_id)
    }

    pub fn tree(&self, tree_id: TreeId) -> Result<Vec<Task>> {
        self.inner.trees.tree(tree_id)
    }

    pub fn tree_status(&self, tree_id: TreeId) -> Result<TreeStatus> {
        self.inner.trees.tree_status(tree_id)
    }

    pub fn trees(&self) -> Vec<TreeSummary> {
        self.inner.trees.summaries()
    }

    pub fn paused(&self) -> Vec<PausedTask> {
        self.inner.step_mode.paused()
    }

    pub fn running_count(&self) -> usize {
        self.inner.limiter.running_count()
    }

    /// Events of a known tree after `since`.
    pub fn replay(&self, tree_id: TreeId, since: u64) -> Result<Vec<Event>> {
        self.inner.trees.tree_status(tree_id)?;
        Ok(self.inner.events.replay(tree_id, since))
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.inner.events.subscribe(filter)
    }

    pub fn subscribe_from(&self, filter: EventFilter, since: u64) -> Subscription {
        self.inner.events.subscribe_from(filter, since)
    }

    pub fn events(&self) -> &EventLog {
        &self.inner.events
    }

    /// Wait until the tree's root is resolved.
    pub async fn wait_for_tree(&self, tree_id: TreeId) -> Result<TreeStatus> {
        let mut subscription = self.subscribe(EventFilter {
            tree_id: Some(tree_id),
            include_system: false,
        });
        loop {
            let status = self.tree_status(tree_id)?;
            if status != TreeStatus::Running {
                return Ok(status);
            }
            if subscription.recv().await.is_none() {
                return Err(Error::Store("event log closed".to_string()));
            }
        }
    }

    /// Wait until `task_id` has entered `status` at least once.
    pub async fn wait_for_status(&self, task_id: TaskId, status: TaskStatus) -> Result<Task> {
        let task = self.task(task_id).ok_or(Error::UnknownTask(task_id))?;
        let mut subscription = self.subscribe(EventFilter {
            tree_id: Some(task.tree_id),
            include_system: false,
        });
        let reached = |event: &Event| {
            event.task_id == Some(task_id) && event.new_status() == Some(status)
        };

        if self.inner.events.replay(task.tree_id, 0).iter().any(reached) {
            return self.task(task_id).ok_or(Error::UnknownTask(task_id));
        }
        loop {
            match subscription.recv().await {
                Some(event) if reached(&event) => {
                    return self.task(task_id).ok_or(Error::UnknownTask(task_id));
                }
                Some(_) => {}
                None => return Err(Error::Store("event log closed".to_string())),
            }
        }
    }

    // ------------------------------------------------------------------
    // Drivers
    // ------------------------------------------------------------------

    fn launch(&self, task_id: TaskId) {
        let token = self.inner.shutdown.child_token();
        lock(&self.inner.active).insert(task_id, token.clone());

        let this = self.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(%task_id, "driver cancelled");
                    Ok(())
                }
                outcome = this.drive(task_id) => outcome,
            };
            if let Err(e) = outcome {
                this.handle_failure(task_id, e);
            }
        });
    }

    async fn drive(&self, task_id: TaskId) -> Result<()> {
        let machine = &self.inner.machine;
        machine.apply(task_id, Transition::to(TaskStatus::Queued))?;

        let slot = self.inner.limiter.acquire(task_id).await;
        let task = self.task(task_id).ok_or(Error::UnknownTask(task_id))?;
        let agent = self.inner.dispatcher.select_agent(&task);
        let task = machine.apply(task_id, Transition::select_agent(&agent))?;

        let Some(slot) = self.step_gate(&task, slot).await? else {
            return Ok(());
        };
        let running = machine.start_running(task_id, slot)?;

        let snapshot = running.task().clone();
        let ctx = DispatchContext {
            sink: EventSink::new(snapshot.clone(), self.inner.events.clone()),
            task: snapshot,
        };
        let outcome = self.inner.dispatcher.execute(ctx).await;

        match outcome {
            DispatchOutcome::Spawn { subtasks, interim } if !subtasks.is_empty() => {
                if let Some(interim) = interim {
                    lock(&self.inner.interim).insert(task_id, interim);
                }
                let (_, children) = self.inner.trees.spawn_and_wait(running, &subtasks)?;
                for child in children {
                    self.launch(child.id);
                }
                Ok(())
            }
            DispatchOutcome::Spawn { interim, .. } => {
                running.finish(machine, Transition::to(TaskStatus::Evaluating))?;
                self.post_process(task_id, interim, Vec::new()).await
            }
            DispatchOutcome::Complete { result } => {
                running.finish(machine, Transition::to(TaskStatus::Evaluating))?;
                self.post_process(task_id, Some(result), Vec::new()).await
            }
            DispatchOutcome::Fail { error } => {
                self.inner.events.append(Event::for_task(
                    running.task(),
                    EventKind::AgentError {
                        message: error.clone(),
                    },
                ))?;
                warn!(%task_id, error = %error, "dispatcher reported failure");
                running.finish(machine, Transition::fail(&error))?;
                self.on_resolved(task_id);
                Ok(())
            }
        }
    }

    /// Hold an AGENT_SELECTED task at the step gate if its tree is gated.
    ///
    /// The slot is given up while paused and re-acquired (at the back of the
    /// queue) after the continue. `None` if the pause was cancelled.
    async fn step_gate(&self, task: &Task, slot: SlotGuard) -> Result<Option<SlotGuard>> {
        let config = self.inner.config.current();
        let Some(reason) = config.config.pause_reason(task.tree_id) else {
            return Ok(Some(slot));
        };

        drop(slot);
        let handle = self.inner.step_mode.pause(task, &reason)?;

        // The config may have changed between the check and the pause.
        if !StepModeController::should_pause(&self.inner.config.current().config, task.tree_id) {
            self.inner.step_mode.continue_task(task.id)?;
        }

        if !handle.wait().await {
            debug!(task_id = %task.id, "pause cancelled");
            return Ok(None);
        }
        Ok(Some(self.inner.limiter.acquire(task.id).await))
    }

    /// Run EVALUATING -> DOCUMENTING -> SUMMARIZING -> COMPLETE.
    async fn post_process(
        &self,
        task_id: TaskId,
        output: Option<Value>,
        children: Vec<ChildOutcome>,
    ) -> Result<()> {
        let machine = &self.inner.machine;
        let post = &self.inner.post_processor;
        let task = self.task(task_id).ok_or(Error::UnknownTask(task_id))?;
        let input = EvaluationInput {
            task,
            output,
            children,
        };

        if self.apply_verdict(task_id, post.evaluate(&input).await)? {
            return Ok(());
        }
        machine.apply(task_id, Transition::to(TaskStatus::Documenting))?;

        if self.apply_verdict(task_id, post.document(&input).await)? {
            return Ok(());
        }
        machine.apply(task_id, Transition::to(TaskStatus::Summarizing))?;

        let transition = match post.summarize(&input).await {
            Ok(result) => Transition::complete(result),
            Err(error) => Transition::fail(&error),
        };
        machine.apply(task_id, transition)?;
        self.on_resolved(task_id);
        Ok(())
    }

    /// True when the verdict resolved the task.
    fn apply_verdict(&self, task_id: TaskId, verdict: Verdict) -> Result<bool> {
        let transition = match verdict {
            Verdict::Proceed => return Ok(false),
            Verdict::Flag { reason } => Transition::flag(&reason),
            Verdict::Fail { error } => Transition::fail(&error),
        };
        self.inner.machine.apply(task_id, transition)?;
        self.on_resolved(task_id);
        Ok(true)
    }

    /// Bookkeeping after `task_id` reached a resolved state: forget its
    /// token, then let its parent proceed if it was the last child.
    fn on_resolved(&self, task_id: TaskId) {
        lock(&self.inner.active).remove(&task_id);
        lock(&self.inner.interim).remove(&task_id);

        let promotion = match self.inner.trees.on_child_resolved(task_id) {
            Ok(Some(promotion)) => promotion,
            Ok(None) => return,
            Err(e) => {
                error!(%task_id, error = %e, "parent readiness check failed");
                return;
            }
        };

        let parent_id = promotion.parent.id;
        if !promotion.needs_evaluation() {
            // Failed by policy; its own parent may now be ready.
            self.on_resolved(parent_id);
            return;
        }

        let token = lock(&self.inner.active)
            .get(&parent_id)
            .cloned()
            .unwrap_or_else(|| self.inner.shutdown.child_token());
        let output = lock(&self.inner.interim).remove(&parent_id);

        let this = self.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => Ok(()),
                outcome = this.post_process(parent_id, output, promotion.children) => outcome,
            };
            if let Err(e) = outcome {
                this.handle_failure(parent_id, e);
            }
        });
    }

    /// A driver hit an error. Fail the task if that edge is legal, flag it
    /// otherwise; do nothing if it was resolved by someone else meanwhile.
    fn handle_failure(&self, task_id: TaskId, err: Error) {
        let Some(task) = self.task(task_id) else {
            error!(%task_id, error = %err, "driver failed for missing task");
            return;
        };
        if task.status.is_resolved() {
            debug!(%task_id, error = %err, "driver stopped, task already resolved");
            lock(&self.inner.active).remove(&task_id);
            return;
        }

        error!(%task_id, status = %task.status, error = %err, "task driver failed");
        let message = err.to_string();
        if let Err(e) = self.inner.events.append(Event::for_task(
            &task,
            EventKind::AgentError {
                message: message.clone(),
            },
        )) {
            error!(%task_id, error = %e, "failed to record driver error");
        }

        let transition = if task.status.can_transition_to(TaskStatus::Failed) {
            Transition::fail(&message)
        } else {
            Transition::flag(&format!("runtime error: {}", message))
        };
        match self.inner.machine.apply(task_id, transition) {
            Ok(_) => self.on_resolved(task_id),
            Err(e) => error!(%task_id, error = %e, "could not resolve failed task"),
        }
    }
}
