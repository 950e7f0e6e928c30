//! Integration test suite for canopy.
//!
//! These tests drive a real orchestrator end to end with a scripted
//! dispatcher standing in for agents.
//!
//! # Test Categories
//!
//! - `lifecycle`: Single-task runs, step mode and failures
//! - `subtasks`: Spawning, parent promotion and review flags
//! - `concurrency`: The `max_parallel_tasks` limit
//! - `events`: Ordering, replay and persistence of the event log
//! - `api`: The HTTP and WebSocket surface, in-process and over a socket
//!
//! # CI Compatibility
//!
//! No agent binary or network access is needed. The socket tests bind
//! an ephemeral port on loopback.

mod fixtures;

mod events;
mod lifecycle;
mod subtasks;
