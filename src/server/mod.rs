//! HTTP and WebSocket surface.
//!
//! The listener comes up before the runtime so `/system/state` and
//! `/health` answer while the journal is loading. Everything else answers
//! 503 until the orchestrator is installed.

mod protocol;
mod routes;
mod stream;

pub use protocol::{parse_client_message, ClientMessage};
pub use routes::{
    ContinueResponse, FlagRequest, FlagResponse, MessagesQuery, MessagesResponse,
    PausedResponse, SubmitRequest, TreesResponse,
};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::core::RuntimeConfig;
use crate::error::Error;
use crate::orchestration::{
    AgentDispatcher, ChildFailurePolicy, DispatchContext, DispatchOutcome, Orchestrator,
    RuntimeParts,
};

/// Lifecycle of the process as reported by `GET /system/state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemState {
    /// Reading the journal.
    Loading,
    /// Running, but no agent dispatcher is configured.
    Uninitialized,
    /// Recovering tasks interrupted by the previous process.
    Initializing,
    Ready,
}

impl SystemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemState::Loading => "loading",
            SystemState::Uninitialized => "uninitialized",
            SystemState::Initializing => "initializing",
            SystemState::Ready => "ready",
        }
    }
}

impl std::fmt::Display for SystemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<OnceLock<Orchestrator>>,
    pub startup: Arc<RwLock<SystemState>>,
}

impl AppState {
    pub fn new_loading() -> Self {
        Self {
            runtime: Arc::new(OnceLock::new()),
            startup: Arc::new(RwLock::new(SystemState::Loading)),
        }
    }

    /// State with the runtime already installed.
    pub fn ready(orchestrator: Orchestrator, state: SystemState) -> Self {
        let runtime = OnceLock::new();
        let _ = runtime.set(orchestrator);
        Self {
            runtime: Arc::new(runtime),
            startup: Arc::new(RwLock::new(state)),
        }
    }

    pub async fn system_state(&self) -> SystemState {
        *self.startup.read().await
    }

    pub async fn set_state(&self, state: SystemState) {
        *self.startup.write().await = state;
    }

    /// Install the runtime and publish `state`.
    pub async fn mark_ready(
        &self,
        orchestrator: Orchestrator,
        state: SystemState,
    ) -> crate::Result<()> {
        self.runtime
            .set(orchestrator)
            .map_err(|_| Error::Store("runtime already initialized".to_string()))?;
        self.set_state(state).await;
        Ok(())
    }

    /// The runtime, or 503 while it is still coming up.
    pub async fn orchestrator(&self) -> Result<&Orchestrator, ApiError> {
        match self.runtime.get() {
            Some(orchestrator) => Ok(orchestrator),
            None => Err(ApiError(Error::NotReady(format!(
                "runtime is {}",
                self.system_state().await
            )))),
        }
    }
}

/// Error rendered as `{ "error": message }` with a matching status code.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::UnknownTask(_) | Error::UnknownTree(_) => StatusCode::NOT_FOUND,
            Error::InvalidTransition { .. }
            | Error::InvalidParentState { .. }
            | Error::OutcomeAlreadyRecorded { .. } => StatusCode::CONFLICT,
            Error::InvalidConfig(_) | Error::Validation(_) | Error::Transport(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health))
        .route("/tasks", post(routes::submit))
        .route("/tasks/all", get(routes::all_trees))
        .route("/tasks/paused", get(routes::paused))
        .route("/tasks/tree/{tree_id}", get(routes::tree))
        .route("/tasks/tree/{tree_id}/messages", get(routes::messages))
        .route("/tasks/{task_id}/continue", post(routes::continue_task))
        .route("/tasks/{task_id}/flag", post(routes::flag))
        .route(
            "/system/config",
            get(routes::get_config).put(routes::put_config),
        )
        .route("/system/state", get(routes::system_state))
        .route("/ws", get(stream::ws_handler))
        .layer(cors)
        .with_state(state)
}

/// Fails every task. Installed when no agent is configured so reads keep
/// working while submission answers 503.
struct Unconfigured;

#[async_trait]
impl AgentDispatcher for Unconfigured {
    async fn execute(&self, _ctx: DispatchContext) -> DispatchOutcome {
        DispatchOutcome::Fail {
            error: "no agent dispatcher configured".to_string(),
        }
    }
}

/// What `serve` needs to bring the runtime up.
pub struct ServeSettings {
    pub addr: SocketAddr,
    pub data_dir: PathBuf,
    pub runtime: RuntimeConfig,
    pub dispatcher: Option<Arc<dyn AgentDispatcher>>,
    pub child_failure_policy: ChildFailurePolicy,
}

/// Bind, bring the runtime up behind the listener and serve until ctrl-c.
pub async fn serve(settings: ServeSettings) -> crate::Result<()> {
    let state = AppState::new_loading();
    let listener = tokio::net::TcpListener::bind(settings.addr).await?;
    info!(addr = %settings.addr, "listening");

    let app = app_router(state.clone());
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                if tokio::signal::ctrl_c().await.is_err() {
                    futures::future::pending::<()>().await;
                }
            })
            .await
    });

    let configured = settings.dispatcher.is_some();
    let dispatcher = settings
        .dispatcher
        .unwrap_or_else(|| Arc::new(Unconfigured));
    let parts = RuntimeParts::load(&settings.data_dir, settings.runtime, dispatcher)?
        .with_child_failure_policy(settings.child_failure_policy);
    let orchestrator = Orchestrator::new(parts);

    state.set_state(SystemState::Initializing).await;
    orchestrator.recover_interrupted()?;

    let ready = if configured {
        SystemState::Ready
    } else {
        SystemState::Uninitialized
    };
    state.mark_ready(orchestrator.clone(), ready).await?;
    info!(state = %ready, "runtime up");

    let result = server
        .await
        .map_err(|e| Error::Store(format!("server task failed: {}", e)))?;
    orchestrator.shutdown();
    result?;
    Ok(())
}
