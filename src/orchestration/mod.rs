//! Orchestration layer.
//!
//! Moves tasks through their lifecycle: the state machine validates every
//! transition, the tree manager spawns children and promotes parents, the
//! limiter bounds how many tasks run, the step-mode controller holds tasks
//! for manual approval and the orchestrator drives it all on tokio.

mod command;
mod config_service;
mod dispatcher;
mod events;
mod limiter;
mod machine;
mod orchestrator;
mod resolver;
mod step_mode;
mod store;

pub use command::{AgentLine, CommandDispatcher, DEFAULT_TIMEOUT_SECS};
pub use config_service::ConfigService;
pub use dispatcher::{
    AgentDispatcher, DispatchContext, DispatchOutcome, DispatcherEvent, EchoDispatcher,
    EvaluationInput, EventSink, PassThrough, PostProcessor, SpawnRequest, Verdict, DEFAULT_AGENT,
};
pub use events::{EventLog, Subscription};
pub use limiter::{ConcurrencyLimiter, SlotGuard};
pub use machine::{RunningTask, StateMachine, Transition};
pub use orchestrator::{
    ContinueOutcome, FlagScope, Orchestrator, RuntimeParts, Submission, INTERRUPTED_REASON,
};
pub use resolver::{ChildFailurePolicy, Promotion, TreeManager};
pub use step_mode::{PauseHandle, PausedTask, StepModeController};
pub use store::TaskStore;
