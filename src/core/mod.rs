//! Core domain models for canopy.
//!
//! This module contains the fundamental data structures used throughout
//! the runtime: tasks, the task forest, events and runtime parameters.

pub mod event;
pub mod runtime_config;
pub mod task;
pub mod tree;

pub use event::{Event, EventFilter, EventKind};
pub use runtime_config::{RuntimeConfig, TreeSelector, VersionedConfig};
pub use task::{Priority, Task, TaskId, TaskStatus, TreeId};
pub use tree::{ChildOutcome, TaskForest, TreeStatus, TreeSummary};
