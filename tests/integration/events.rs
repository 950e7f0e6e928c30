//! Event log tests: ordering, replay/subscribe equivalence, system events
//! and persistence across restarts.

use std::sync::Arc;

use futures::StreamExt;
use tempfile::TempDir;

use canopy::core::{EventFilter, EventKind, RuntimeConfig, TaskStatus, TreeStatus};
use canopy::orchestration::{EchoDispatcher, Orchestrator, RuntimeParts};

use crate::fixtures::{config, within, Harness, Script};

/// Test: Per-tree sequences
/// Given two trees running side by side
/// When both complete
/// Then each tree's log is numbered 1..N without gaps
#[tokio::test]
async fn test_sequences_are_dense_per_tree() {
    let harness = Harness::new(config(4, false));
    let a = harness.orchestrator.submit("a").unwrap();
    let b = harness.orchestrator.submit("b").unwrap();
    for tree_id in [a.tree_id, b.tree_id] {
        within(harness.orchestrator.wait_for_tree(tree_id))
            .await
            .unwrap();
    }

    for tree_id in [a.tree_id, b.tree_id] {
        let events = harness.events(tree_id);
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        let expected: Vec<u64> = (1..=events.len() as u64).collect();
        assert_eq!(sequences, expected);
        assert!(events.iter().all(|e| e.tree_id == Some(tree_id)));
        assert!(events
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp));
    }
}

/// Test: Live subscription matches replay
/// Given a subscriber attached before submission
/// When the tree runs to completion
/// Then the subscriber saw exactly the replayed history, in order
#[tokio::test]
async fn test_subscription_matches_replay() {
    let harness = Harness::new(config(2, false));
    harness.dispatcher.script(
        "plan",
        Script::Spawn(
            vec![canopy::orchestration::SpawnRequest::new("child")],
            None,
        ),
    );
    let mut subscription = harness.orchestrator.subscribe(EventFilter {
        tree_id: None,
        include_system: false,
    });

    let submission = harness.orchestrator.submit("plan").unwrap();
    within(harness.orchestrator.wait_for_tree(submission.tree_id))
        .await
        .unwrap();

    let history = harness.events(submission.tree_id);
    let mut live = Vec::new();
    while live.len() < history.len() {
        live.push(within(subscription.recv()).await.unwrap());
    }
    assert_eq!(live, history);
}

/// Test: Replay a prefix, then subscribe from its end
/// Given a finished tree with N events
/// When events [1, k] are replayed and a subscription resumes after k
/// Then together they equal the full history with no duplicates
#[tokio::test]
async fn test_replay_prefix_then_resume() {
    let harness = Harness::new(config(1, false));
    let submission = harness.orchestrator.submit("x").unwrap();
    within(harness.orchestrator.wait_for_tree(submission.tree_id))
        .await
        .unwrap();

    let history = harness.events(submission.tree_id);
    let k = 3;
    let prefix: Vec<_> = history.iter().take(k).cloned().collect();

    let resumed = harness
        .orchestrator
        .subscribe_from(EventFilter::tree(submission.tree_id), k as u64)
        .into_stream()
        .take(history.len() - k);
    let rest: Vec<_> = within(resumed.collect::<Vec<_>>()).await;

    let mut combined = prefix;
    combined.extend(rest);
    assert_eq!(combined, history);

    // Replaying from the cursor returns the same suffix.
    let suffix = harness
        .orchestrator
        .replay(submission.tree_id, k as u64)
        .unwrap();
    assert_eq!(suffix, history[k..].to_vec());
}

/// Test: Config updates are system events
/// Given a subscriber to one tree
/// When the runtime config is replaced
/// Then the subscriber receives config_updated, which is not part of any tree
#[tokio::test]
async fn test_config_update_reaches_tree_subscribers() {
    let harness = Harness::new(config(1, false));
    let submission = harness.orchestrator.submit("x").unwrap();
    within(harness.orchestrator.wait_for_tree(submission.tree_id))
        .await
        .unwrap();

    let mut subscription = harness
        .orchestrator
        .subscribe(EventFilter::tree(submission.tree_id));
    harness
        .orchestrator
        .update_config(RuntimeConfig {
            max_parallel_tasks: 5,
            ..Default::default()
        })
        .unwrap();

    let event = within(subscription.recv()).await.unwrap();
    assert!(event.is_system());
    match event.kind {
        EventKind::ConfigUpdated { version, config } => {
            assert_eq!(version, 1);
            assert_eq!(config.max_parallel_tasks, 5);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(!harness
        .events(submission.tree_id)
        .iter()
        .any(|e| e.kind.name() == "config_updated"));
}

/// Test: Invalid config is rejected
/// Given a config with max_parallel_tasks=0
/// When it is submitted
/// Then it is rejected and the current version is unchanged
#[tokio::test]
async fn test_invalid_config_rejected() {
    let harness = Harness::new(config(2, false));
    assert!(harness
        .orchestrator
        .update_config(config(0, false))
        .is_err());
    let current = harness.orchestrator.config();
    assert_eq!(current.version, 0);
    assert_eq!(current.config.max_parallel_tasks, 2);
    assert!(harness.orchestrator.events().replay_system(0).is_empty());
}

/// Test: History survives a restart
/// Given a journal-backed runtime that completed a tree
/// When a new runtime is loaded from the same directory
/// Then the tree, its events and the config version are restored
#[tokio::test]
async fn test_history_survives_restart() {
    let dir = TempDir::new().unwrap();
    let (tree_id, history) = {
        let parts =
            RuntimeParts::load(dir.path(), RuntimeConfig::default(), Arc::new(EchoDispatcher))
                .unwrap();
        let orchestrator = Orchestrator::new(parts);
        let submission = orchestrator.submit("remember me").unwrap();
        within(orchestrator.wait_for_tree(submission.tree_id))
            .await
            .unwrap();
        orchestrator.update_config(config(2, true)).unwrap();
        let history = orchestrator.replay(submission.tree_id, 0).unwrap();
        orchestrator.shutdown();
        (submission.tree_id, history)
    };

    let parts = RuntimeParts::load(dir.path(), RuntimeConfig::default(), Arc::new(EchoDispatcher))
        .unwrap();
    let orchestrator = Orchestrator::new(parts);
    assert!(orchestrator.recover_interrupted().unwrap().is_empty());

    assert_eq!(orchestrator.tree_status(tree_id).unwrap(), TreeStatus::Complete);
    assert_eq!(orchestrator.replay(tree_id, 0).unwrap(), history);
    assert_eq!(
        orchestrator.task(history[0].task_id.unwrap()).unwrap().status,
        TaskStatus::Complete
    );

    let restored = orchestrator.config();
    assert_eq!(restored.version, 1);
    assert!(restored.config.step_mode);
    assert_eq!(orchestrator.events().replay_system(0).len(), 1);
}
