//! Single-task lifecycle tests: the happy path, step mode and failures.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use canopy::core::{EventKind, RuntimeConfig, TaskId, TaskStatus, TreeSelector, TreeStatus};
use canopy::orchestration::{
    ContinueOutcome, EvaluationInput, Orchestrator, PostProcessor, RuntimeParts, Verdict,
};

use crate::fixtures::{
    config, is_kind, is_pause, is_status, position, settle_briefly, within, Harness, Script,
    ScriptedDispatcher,
};

use TaskStatus::*;

/// Test: Scenario A - no step mode, one slot
/// Given max_parallel_tasks=1 and step mode off
/// When a task is submitted and the dispatcher succeeds without children
/// Then it runs without pausing and ends COMPLETE
#[tokio::test]
async fn test_task_runs_to_completion_without_pause() {
    let harness = Harness::new(config(1, false));
    let submission = harness.orchestrator.submit("write the report").unwrap();
    assert_eq!(submission.task_id, TaskId(1));

    let status = within(harness.orchestrator.wait_for_tree(submission.tree_id))
        .await
        .unwrap();
    assert_eq!(status, TreeStatus::Complete);

    assert_eq!(
        harness.statuses(submission.tree_id, TaskId(1)),
        vec![Queued, AgentSelected, Running, Evaluating, Documenting, Summarizing, Complete]
    );
    let events = harness.events(submission.tree_id);
    assert!(!events.iter().any(is_pause));
    assert!(matches!(events[0].kind, EventKind::TaskCreated { .. }));

    let task = harness.orchestrator.task(TaskId(1)).unwrap();
    assert_eq!(task.result, Some(json!({"done": "write the report"})));
    assert!(task.started_at.is_some());
    assert!(task.completed_at.is_some());
    assert_eq!(harness.orchestrator.running_count(), 0);
}

/// Test: Scenario B - global step mode
/// Given step mode enabled globally
/// When a task is submitted
/// Then it pauses at AGENT_SELECTED and only runs after one continue
#[tokio::test]
async fn test_step_mode_holds_task_until_continue() {
    let harness = Harness::new(config(4, true));
    let submission = harness.orchestrator.submit("careful work").unwrap();
    harness.wait_paused(TaskId(1)).await;

    let paused = harness.orchestrator.paused();
    assert_eq!(paused.len(), 1);
    assert_eq!(paused[0].task_id, TaskId(1));
    assert_eq!(paused[0].tree_id, submission.tree_id);
    assert_eq!(paused[0].reason, "step mode enabled globally");

    settle_briefly().await;
    assert_eq!(harness.status(TaskId(1)), AgentSelected);
    assert!(harness.dispatcher.executed().is_empty());

    assert_eq!(
        harness.orchestrator.continue_task(TaskId(1)).unwrap(),
        ContinueOutcome::Resumed
    );
    assert!(harness.orchestrator.paused().is_empty());

    within(harness.orchestrator.wait_for_tree(submission.tree_id))
        .await
        .unwrap();
    assert_eq!(harness.status(TaskId(1)), Complete);

    let events = harness.events(submission.tree_id);
    let pause = position(&events, is_pause).unwrap();
    let resumed = position(&events, is_kind(TaskId(1), "step_continued")).unwrap();
    let running = position(&events, is_status(TaskId(1), Running)).unwrap();
    assert!(pause < resumed && resumed < running);
}

/// Test: Continue is idempotent
/// Given a paused task
/// When continue is sent twice
/// Then exactly one step_continued is recorded
#[tokio::test]
async fn test_second_continue_is_noop() {
    let harness = Harness::new(config(4, true));
    let submission = harness.orchestrator.submit("x").unwrap();
    harness.wait_paused(TaskId(1)).await;

    assert_eq!(
        harness.orchestrator.continue_task(TaskId(1)).unwrap(),
        ContinueOutcome::Resumed
    );
    assert_eq!(
        harness.orchestrator.continue_task(TaskId(1)).unwrap(),
        ContinueOutcome::NotPaused
    );
    within(harness.orchestrator.wait_for_tree(submission.tree_id))
        .await
        .unwrap();

    let continued = harness
        .kinds(submission.tree_id, TaskId(1))
        .into_iter()
        .filter(|kind| *kind == "step_continued")
        .count();
    assert_eq!(continued, 1);
}

/// Test: Continue for an unknown task
/// Given no task 42
/// When continue(42) is sent
/// Then nothing happens and no error is raised
#[tokio::test]
async fn test_continue_unknown_task_is_noop() {
    let harness = Harness::new(config(4, true));
    assert_eq!(
        harness.orchestrator.continue_task(TaskId(42)).unwrap(),
        ContinueOutcome::UnknownTask
    );
    assert!(harness.orchestrator.trees().is_empty());
}

/// Test: Per-tree step mode
/// Given step mode configured only for a tree that is not submitted
/// When a task is submitted
/// Then it runs without pausing
#[tokio::test]
async fn test_step_mode_for_other_tree_does_not_pause() {
    let harness = Harness::new(RuntimeConfig {
        step_mode_threads: vec![TreeSelector::Tree(canopy::core::TreeId::new())],
        ..Default::default()
    });
    let submission = harness.orchestrator.submit("x").unwrap();
    let status = within(harness.orchestrator.wait_for_tree(submission.tree_id))
        .await
        .unwrap();
    assert_eq!(status, TreeStatus::Complete);
    assert!(!harness.events(submission.tree_id).iter().any(is_pause));
}

/// Test: Wildcard entry in step_mode_threads
/// Given step_mode_threads = ["*"]
/// When a task is submitted
/// Then it pauses with the all-trees reason
#[tokio::test]
async fn test_wildcard_tree_selector_pauses() {
    let harness = Harness::new(RuntimeConfig {
        step_mode_threads: vec![TreeSelector::All],
        ..Default::default()
    });
    harness.orchestrator.submit("x").unwrap();
    harness.wait_paused(TaskId(1)).await;
    assert_eq!(
        harness.orchestrator.paused()[0].reason,
        "step mode enabled for all trees"
    );
}

/// Test: Disabling step mode releases paused tasks
/// Given two trees paused under global step mode
/// When the config keeps step mode only for the first tree
/// Then the second continues (with step_continued) and the first stays paused
#[tokio::test]
async fn test_config_update_releases_ungated_trees() {
    let harness = Harness::new(config(4, true));
    let first = harness.orchestrator.submit("first").unwrap();
    let second = harness.orchestrator.submit("second").unwrap();
    harness.wait_paused(first.task_id).await;
    harness.wait_paused(second.task_id).await;

    harness
        .orchestrator
        .update_config(RuntimeConfig {
            step_mode: false,
            step_mode_threads: vec![TreeSelector::Tree(first.tree_id)],
            ..config(4, false)
        })
        .unwrap();

    let status = within(harness.orchestrator.wait_for_tree(second.tree_id))
        .await
        .unwrap();
    assert_eq!(status, TreeStatus::Complete);
    assert!(harness
        .kinds(second.tree_id, second.task_id)
        .contains(&"step_continued"));

    settle_briefly().await;
    let paused = harness.orchestrator.paused();
    assert_eq!(paused.len(), 1);
    assert_eq!(paused[0].task_id, first.task_id);
    assert_eq!(harness.status(first.task_id), AgentSelected);
}

/// Test: Dispatcher failure
/// Given a dispatcher that reports failure
/// When the task runs
/// Then it ends FAILED with the error and an agent_error event
#[tokio::test]
async fn test_dispatcher_failure_fails_task() {
    let harness = Harness::new(config(2, false));
    harness
        .dispatcher
        .script("doomed", Script::Fail("disk full".to_string()));
    let submission = harness.orchestrator.submit("doomed").unwrap();

    let status = within(harness.orchestrator.wait_for_tree(submission.tree_id))
        .await
        .unwrap();
    assert_eq!(status, TreeStatus::Failed);

    let task = harness.orchestrator.task(TaskId(1)).unwrap();
    assert_eq!(task.status, Failed);
    assert_eq!(task.error.as_deref(), Some("disk full"));
    assert!(task.result.is_none());

    let events = harness.events(submission.tree_id);
    let error = events
        .iter()
        .find(|event| matches!(event.kind, EventKind::AgentError { .. }))
        .unwrap();
    assert_eq!(
        error.kind,
        EventKind::AgentError {
            message: "disk full".to_string()
        }
    );
    assert_eq!(error.agent_name.as_deref(), Some("default"));

    let summary = &harness.orchestrator.trees()[0];
    assert_eq!(summary.status, TreeStatus::Failed);
    assert!(!summary.has_running_tasks);
}

/// Test: Dispatcher events reach the tree's log
/// Given a dispatcher that emits thinking text
/// When the task runs
/// Then the agent_thinking event is logged between RUNNING and EVALUATING
#[tokio::test]
async fn test_dispatcher_events_are_logged_in_order() {
    let harness = Harness::new(config(1, false));
    let submission = harness.orchestrator.submit("think").unwrap();
    within(harness.orchestrator.wait_for_tree(submission.tree_id))
        .await
        .unwrap();

    let events = harness.events(submission.tree_id);
    let running = position(&events, is_status(TaskId(1), Running)).unwrap();
    let thinking = position(&events, is_kind(TaskId(1), "agent_thinking")).unwrap();
    let evaluating = position(&events, is_status(TaskId(1), Evaluating)).unwrap();
    assert!(running < thinking && thinking < evaluating);
}

struct FlagOnEvaluate;

#[async_trait]
impl PostProcessor for FlagOnEvaluate {
    async fn evaluate(&self, input: &EvaluationInput) -> Verdict {
        Verdict::Flag {
            reason: format!("needs eyes: {}", input.task.instruction),
        }
    }

    async fn summarize(&self, _input: &EvaluationInput) -> Result<Value, String> {
        Ok(Value::Null)
    }
}

/// Test: Evaluation can flag for review
/// Given a post-processor that flags every evaluation
/// When a task completes execution
/// Then it ends REVIEW_FLAGGED with the reason and the tree reports it
#[tokio::test]
async fn test_evaluation_flags_for_review() {
    let dispatcher = ScriptedDispatcher::new();
    let parts = RuntimeParts::in_memory(RuntimeConfig::default(), dispatcher)
        .unwrap()
        .with_post_processor(Arc::new(FlagOnEvaluate));
    let orchestrator = Orchestrator::new(parts);

    let submission = orchestrator.submit("risky change").unwrap();
    let status = within(orchestrator.wait_for_tree(submission.tree_id))
        .await
        .unwrap();
    assert_eq!(status, TreeStatus::ReviewFlagged);

    let task = orchestrator.task(submission.task_id).unwrap();
    assert_eq!(task.status, ReviewFlagged);
    assert_eq!(task.review_reason.as_deref(), Some("needs eyes: risky change"));
}

/// Test: Empty instruction
/// Given an empty instruction
/// When submitted
/// Then it is rejected and no tree is created
#[tokio::test]
async fn test_empty_instruction_rejected() {
    let harness = Harness::new(config(1, false));
    assert!(harness.orchestrator.submit("").is_err());
    assert!(harness.orchestrator.trees().is_empty());
}
