pub mod client;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod server;
pub mod state;

pub use error::{Error, Result};
pub use orchestration::{Orchestrator, RuntimeParts};
