//! Parent/child tests: spawning, promotion, child failure policy and
//! review flagging across a subtree.

use serde_json::json;

use canopy::core::{TaskId, TaskStatus, TreeStatus};
use canopy::orchestration::{ChildFailurePolicy, FlagScope, SpawnRequest};

use crate::fixtures::{config, eventually, is_status, settle_briefly, within, Harness, Script};

use TaskStatus::*;

fn spawn(children: &[&str]) -> Script {
    Script::Spawn(
        children.iter().map(|c| SpawnRequest::new(c)).collect(),
        Some(json!("plan notes")),
    )
}

/// Test: Scenario C - parent waits for every child
/// Given a root that spawns two children
/// When the first child completes
/// Then the root is still WAITING_SUBTASKS
/// And when the second completes the root enters EVALUATING exactly once
#[tokio::test]
async fn test_parent_promoted_once_after_last_child() {
    let harness = Harness::new(config(4, false));
    harness.dispatcher.script("plan", spawn(&["child a", "child b"]));
    harness.dispatcher.hold("child a");
    harness.dispatcher.hold("child b");

    let submission = harness.orchestrator.submit("plan").unwrap();
    harness.wait_for(TaskId(1), WaitingSubtasks).await;
    harness.wait_for(TaskId(2), Running).await;
    harness.wait_for(TaskId(3), Running).await;

    let tree = harness.orchestrator.tree(submission.tree_id).unwrap();
    assert_eq!(tree.len(), 3);
    assert!(tree[1..]
        .iter()
        .all(|t| t.parent_id == Some(TaskId(1)) && t.tree_id == submission.tree_id));
    // The waiting parent holds no slot.
    assert_eq!(harness.orchestrator.running_count(), 2);

    harness.dispatcher.release("child a");
    harness.wait_for(TaskId(2), Complete).await;
    settle_briefly().await;
    assert_eq!(harness.status(TaskId(1)), WaitingSubtasks);
    assert!(!harness
        .events(submission.tree_id)
        .iter()
        .any(is_status(TaskId(1), Evaluating)));

    harness.dispatcher.release("child b");
    let status = within(harness.orchestrator.wait_for_tree(submission.tree_id))
        .await
        .unwrap();
    assert_eq!(status, TreeStatus::Complete);

    let evaluations = harness
        .statuses(submission.tree_id, TaskId(1))
        .into_iter()
        .filter(|s| *s == Evaluating)
        .count();
    assert_eq!(evaluations, 1);

    let root = harness.orchestrator.task(TaskId(1)).unwrap();
    let result = root.result.unwrap();
    assert_eq!(result["output"], "plan notes");
    assert_eq!(result["children"][0]["task_id"], 2);
    assert_eq!(result["children"][1]["status"], "COMPLETE");
}

/// Test: Child failure with the default policy
/// Given a root whose second child fails
/// When both children resolve
/// Then the root still completes and sees the failure in its children
#[tokio::test]
async fn test_child_failure_left_to_parent() {
    let harness = Harness::new(config(4, false));
    harness.dispatcher.script("plan", spawn(&["fine", "broken"]));
    harness
        .dispatcher
        .script("broken", Script::Fail("no network".to_string()));

    let submission = harness.orchestrator.submit("plan").unwrap();
    let status = within(harness.orchestrator.wait_for_tree(submission.tree_id))
        .await
        .unwrap();
    assert_eq!(status, TreeStatus::Complete);

    assert_eq!(harness.status(TaskId(3)), Failed);
    let result = harness.orchestrator.task(TaskId(1)).unwrap().result.unwrap();
    assert_eq!(result["children"][1]["status"], "FAILED");
    assert_eq!(result["children"][1]["error"], "no network");
}

/// Test: Child failure with the fail-parent policy
/// Given fail_parent and a root whose child fails
/// When the children resolve
/// Then the root is FAILED naming the failed child
#[tokio::test]
async fn test_child_failure_fails_parent_by_policy() {
    let harness = Harness::with_policy(config(4, false), ChildFailurePolicy::FailParent);
    harness.dispatcher.script("plan", spawn(&["fine", "broken"]));
    harness
        .dispatcher
        .script("broken", Script::Fail("no network".to_string()));

    let submission = harness.orchestrator.submit("plan").unwrap();
    let status = within(harness.orchestrator.wait_for_tree(submission.tree_id))
        .await
        .unwrap();
    assert_eq!(status, TreeStatus::Failed);

    let root = harness.orchestrator.task(TaskId(1)).unwrap();
    let error = root.error.unwrap();
    assert!(error.contains("child task 3 failed"), "got {error}");
    assert!(error.contains("no network"));
}

/// Test: Nested subtrees
/// Given a root spawning a child that itself spawns two leaves
/// When the leaves complete
/// Then promotion cascades up to the root
#[tokio::test]
async fn test_nested_spawn_cascades() {
    let harness = Harness::new(config(2, false));
    harness.dispatcher.script("root", spawn(&["middle"]));
    harness.dispatcher.script("middle", spawn(&["leaf 1", "leaf 2"]));

    let submission = harness.orchestrator.submit("root").unwrap();
    let status = within(harness.orchestrator.wait_for_tree(submission.tree_id))
        .await
        .unwrap();
    assert_eq!(status, TreeStatus::Complete);

    let tree = harness.orchestrator.tree(submission.tree_id).unwrap();
    assert_eq!(tree.len(), 4);
    assert!(tree.iter().all(|t| t.status == Complete));
    assert_eq!(
        harness.orchestrator.task(TaskId(3)).unwrap().parent_id,
        Some(TaskId(2))
    );
    assert!(harness.dispatcher.max_running() <= 2);
}

/// Test: Spawning nothing
/// Given a dispatcher that spawns an empty child list with interim output
/// When the task runs
/// Then it completes directly with that output
#[tokio::test]
async fn test_empty_spawn_completes_directly() {
    let harness = Harness::new(config(1, false));
    harness
        .dispatcher
        .script("solo", Script::Spawn(vec![], Some(json!("alone"))));

    let submission = harness.orchestrator.submit("solo").unwrap();
    within(harness.orchestrator.wait_for_tree(submission.tree_id))
        .await
        .unwrap();

    let root = harness.orchestrator.task(TaskId(1)).unwrap();
    assert_eq!(root.result, Some(json!("alone")));
    assert!(!harness
        .statuses(submission.tree_id, TaskId(1))
        .contains(&WaitingSubtasks));
}

/// Test: Agent hints on children
/// Given a child spawned with an agent hint
/// When it is selected
/// Then it is bound to the hinted agent
#[tokio::test]
async fn test_child_agent_hint_is_used() {
    let harness = Harness::new(config(2, false));
    harness.dispatcher.script(
        "plan",
        Script::Spawn(vec![SpawnRequest::with_agent("review it", "reviewer")], None),
    );
    let submission = harness.orchestrator.submit("plan").unwrap();
    within(harness.orchestrator.wait_for_tree(submission.tree_id))
        .await
        .unwrap();

    assert_eq!(
        harness.orchestrator.task(TaskId(1)).unwrap().agent_name.as_deref(),
        Some("default")
    );
    assert_eq!(
        harness.orchestrator.task(TaskId(2)).unwrap().agent_name.as_deref(),
        Some("reviewer")
    );
}

/// Test: Flagging a whole subtree
/// Given a root with two running children and an unrelated tree
/// When the root is flagged with subtree scope
/// Then the root and both children are REVIEW_FLAGGED, their executions stop,
/// and the other tree is untouched
#[tokio::test]
async fn test_subtree_flag_stops_descendants_only() {
    let harness = Harness::new(config(4, false));
    harness.dispatcher.script("plan", spawn(&["a", "b"]));
    harness.dispatcher.hold("a");
    harness.dispatcher.hold("b");
    harness.dispatcher.hold("other");

    let submission = harness.orchestrator.submit("plan").unwrap();
    harness.wait_for(TaskId(1), WaitingSubtasks).await;
    harness.wait_for(TaskId(2), Running).await;
    harness.wait_for(TaskId(3), Running).await;
    let other = harness.orchestrator.submit("other").unwrap();
    harness.wait_for(other.task_id, Running).await;

    let flagged = harness
        .orchestrator
        .flag_for_review(TaskId(1), "wrong direction", FlagScope::Subtree)
        .unwrap();
    assert_eq!(flagged, vec![TaskId(1), TaskId(2), TaskId(3)]);

    for id in [1, 2, 3] {
        let task = harness.orchestrator.task(TaskId(id)).unwrap();
        assert_eq!(task.status, ReviewFlagged);
        assert_eq!(task.review_reason.as_deref(), Some("wrong direction"));
    }
    assert_eq!(
        harness.orchestrator.tree_status(submission.tree_id).unwrap(),
        TreeStatus::ReviewFlagged
    );

    // Only the unrelated execution is still inside the dispatcher.
    eventually(|| harness.dispatcher.running() == 1).await;
    eventually(|| harness.orchestrator.running_count() == 1).await;
    assert_eq!(harness.status(other.task_id), Running);

    harness.dispatcher.release("other");
    let status = within(harness.orchestrator.wait_for_tree(other.tree_id))
        .await
        .unwrap();
    assert_eq!(status, TreeStatus::Complete);
}

/// Test: Flagging a single child
/// Given a root with two children
/// When one child is flagged with task scope
/// Then its sibling keeps running and the root proceeds once the sibling is done
#[tokio::test]
async fn test_flagged_child_counts_as_resolved() {
    let harness = Harness::new(config(4, false));
    harness.dispatcher.script("plan", spawn(&["a", "b"]));
    harness.dispatcher.hold("a");
    harness.dispatcher.hold("b");

    let submission = harness.orchestrator.submit("plan").unwrap();
    harness.wait_for(TaskId(1), WaitingSubtasks).await;
    harness.wait_for(TaskId(2), Running).await;
    harness.wait_for(TaskId(3), Running).await;

    let flagged = harness
        .orchestrator
        .flag_for_review(TaskId(2), "suspicious", FlagScope::Task)
        .unwrap();
    assert_eq!(flagged, vec![TaskId(2)]);
    assert_eq!(harness.status(TaskId(3)), Running);
    assert_eq!(harness.status(TaskId(1)), WaitingSubtasks);

    harness.dispatcher.release("b");
    let status = within(harness.orchestrator.wait_for_tree(submission.tree_id))
        .await
        .unwrap();
    assert_eq!(status, TreeStatus::Complete);

    let result = harness.orchestrator.task(TaskId(1)).unwrap().result.unwrap();
    assert_eq!(result["children"][0]["status"], "REVIEW_FLAGGED");
    assert_eq!(result["children"][0]["review_reason"], "suspicious");
}
