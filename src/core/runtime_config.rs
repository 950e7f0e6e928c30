//! Process-wide runtime parameters.
//!
//! `RuntimeConfig` is a plain value. It is never mutated in place: updates
//! build a new value and swap it in as a new `VersionedConfig`.

use serde::{Deserialize, Serialize};

use crate::core::task::TreeId;
use crate::error::{Error, Result};

pub const DEFAULT_MAX_PARALLEL_TASKS: usize = 4;

/// Wire form of the "every tree" selector.
pub const ALL_TREES: &str = "*";

/// An entry of `step_mode_threads`: one tree, or every tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TreeSelector {
    All,
    Tree(TreeId),
}

impl TryFrom<String> for TreeSelector {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        if value == ALL_TREES {
            return Ok(TreeSelector::All);
        }
        value
            .parse::<TreeId>()
            .map(TreeSelector::Tree)
            .map_err(|e| format!("invalid tree selector {:?}: {}", value, e))
    }
}

impl From<TreeSelector> for String {
    fn from(selector: TreeSelector) -> Self {
        match selector {
            TreeSelector::All => ALL_TREES.to_string(),
            TreeSelector::Tree(id) => id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_max_parallel_tasks")]
    pub max_parallel_tasks: usize,
    /// Pause every task before it runs.
    #[serde(default)]
    pub step_mode: bool,
    /// Trees with step mode enabled individually.
    #[serde(default)]
    pub step_mode_threads: Vec<TreeSelector>,
}

fn default_max_parallel_tasks() -> usize {
    DEFAULT_MAX_PARALLEL_TASKS
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: DEFAULT_MAX_PARALLEL_TASKS,
            step_mode: false,
            step_mode_threads: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_tasks < 1 {
            return Err(Error::InvalidConfig(
                "max_parallel_tasks must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether tasks of `tree_id` stop at the step gate.
    pub fn step_mode_for(&self, tree_id: TreeId) -> bool {
        self.pause_reason(tree_id).is_some()
    }

    /// Human-readable reason a task of `tree_id` would be paused.
    pub fn pause_reason(&self, tree_id: TreeId) -> Option<String> {
        if self.step_mode {
            return Some("step mode enabled globally".to_string());
        }
        if self.step_mode_threads.contains(&TreeSelector::All) {
            return Some("step mode enabled for all trees".to_string());
        }
        if self.step_mode_threads.contains(&TreeSelector::Tree(tree_id)) {
            return Some(format!("step mode enabled for tree {}", tree_id.short()));
        }
        None
    }
}

/// A config value and its version. Version 0 is the startup value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedConfig {
    pub version: u64,
    pub config: RuntimeConfig,
}
