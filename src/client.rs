//! Client side of the server surface.
//!
//! `ApiClient` wraps the REST endpoints. `StreamClient` keeps a WebSocket
//! to `/ws` open across transport failures: it reconnects after a fixed
//! delay, then replays what it missed over REST, and drops anything it has
//! already delivered.

use std::collections::HashMap;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{Event, RuntimeConfig, Task, TaskId, TreeId, VersionedConfig};
use crate::error::{Error, Result};
use crate::orchestration::Submission;
use crate::server::{
    ClientMessage, ContinueResponse, FlagRequest, FlagResponse, MessagesResponse,
    PausedResponse, SubmitRequest, SystemState, TreesResponse,
};

/// Fixed delay between a transport loss and the next connection attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

// ========== REST ==========

/// Thin typed wrapper over the REST endpoints.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    /// `base_url` like `http://127.0.0.1:7878`.
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let message = body["error"].as_str().unwrap_or("no error message");
        Err(Error::Transport(format!("server returned {}: {}", status, message)))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        Self::decode(self.http.get(self.url(path)).send().await?).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        Self::decode(self.http.post(self.url(path)).json(body).send().await?).await
    }

    pub async fn submit(&self, instruction: &str) -> Result<Submission> {
        self.post(
            "/tasks",
            &SubmitRequest {
                instruction: instruction.to_string(),
            },
        )
        .await
    }

    pub async fn trees(&self) -> Result<TreesResponse> {
        self.get("/tasks/all").await
    }

    pub async fn tree(&self, tree_id: TreeId) -> Result<Vec<Task>> {
        self.get(&format!("/tasks/tree/{}", tree_id)).await
    }

    pub async fn messages(&self, tree_id: TreeId, since: u64) -> Result<MessagesResponse> {
        self.get(&format!("/tasks/tree/{}/messages?since={}", tree_id, since))
            .await
    }

    pub async fn paused(&self) -> Result<PausedResponse> {
        self.get("/tasks/paused").await
    }

    pub async fn continue_task(&self, task_id: TaskId) -> Result<ContinueResponse> {
        self.post(
            &format!("/tasks/{}/continue", task_id),
            &serde_json::json!({}),
        )
        .await
    }

    pub async fn flag(&self, task_id: TaskId, reason: &str, subtree: bool) -> Result<FlagResponse> {
        self.post(
            &format!("/tasks/{}/flag", task_id),
            &FlagRequest {
                reason: reason.to_string(),
                subtree,
            },
        )
        .await
    }

    pub async fn config(&self) -> Result<VersionedConfig> {
        self.get("/system/config").await
    }

    pub async fn set_config(&self, config: &RuntimeConfig) -> Result<VersionedConfig> {
        Self::decode(
            self.http
                .put(self.url("/system/config"))
                .json(config)
                .send()
                .await?,
        )
        .await
    }

    pub async fn system_state(&self) -> Result<SystemState> {
        #[derive(serde::Deserialize)]
        struct StateResponse {
            state: SystemState,
        }
        let response: StateResponse = self.get("/system/state").await?;
        Ok(response.state)
    }

    /// `/ws` URL for `tree_id`, or for every tree.
    pub fn stream_url(&self, tree_id: Option<TreeId>) -> String {
        let base = self
            .base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        match tree_id {
            Some(tree_id) => format!("{}/ws?tree_id={}", base, tree_id),
            None => format!("{}/ws", base),
        }
    }
}

// ========== Connection state ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    /// `disconnected -> connecting -> connected -> disconnected`, and a
    /// failed attempt goes from connecting straight back to disconnected.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        write!(f, "{}", s)
    }
}

// ========== Stream ==========

/// Sends commands through a running `StreamClient`. Commands issued while
/// disconnected are delivered after the next successful connect.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    commands: mpsc::UnboundedSender<ClientMessage>,
}

impl StreamHandle {
    pub fn send_continue(&self, task_id: TaskId) -> Result<()> {
        self.commands
            .send(ClientMessage::ContinueStep { task_id })
            .map_err(|_| Error::Transport("stream client stopped".to_string()))
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Why a connected session ended.
enum SessionEnd {
    Cancelled,
    Lost,
}

pub struct StreamClient {
    api: ApiClient,
    tree_id: Option<TreeId>,
    state: ConnectionState,
    reconnect_delay: Duration,
    /// Highest sequence delivered per stream (`None` is the system stream).
    cursors: HashMap<Option<TreeId>, u64>,
    commands: mpsc::UnboundedReceiver<ClientMessage>,
    handle: StreamHandle,
}

impl StreamClient {
    /// Stream `tree_id`, or every tree when `None`.
    pub fn new(api: ApiClient, tree_id: Option<TreeId>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            api,
            tree_id,
            state: ConnectionState::Disconnected,
            reconnect_delay: RECONNECT_DELAY,
            cursors: HashMap::new(),
            commands: rx,
            handle: StreamHandle { commands: tx },
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    /// Queue a `continue_step` for `task_id`.
    pub fn send_continue(&self, task_id: TaskId) -> Result<()> {
        self.handle.send_continue(task_id)
    }

    fn transition(&mut self, next: ConnectionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidConnectionTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!(from = %self.state, to = %next, "stream connection");
        self.state = next;
        Ok(())
    }

    /// Pass `event` through unless it was already delivered.
    fn accept(&mut self, event: Event) -> Option<Event> {
        let cursor = self.cursors.entry(event.tree_id).or_insert(0);
        if event.sequence <= *cursor {
            return None;
        }
        *cursor = event.sequence;
        Some(event)
    }

    /// Deliver events to `on_event` until `cancel` fires, reconnecting
    /// after every transport loss.
    pub async fn run<F>(&mut self, cancel: CancellationToken, mut on_event: F) -> Result<()>
    where
        F: FnMut(Event),
    {
        let url = self.api.stream_url(self.tree_id);
        loop {
            self.transition(ConnectionState::Connecting)?;
            let connected = tokio::select! {
                _ = cancel.cancelled() => {
                    self.transition(ConnectionState::Disconnected)?;
                    return Ok(());
                }
                connected = tokio_tungstenite::connect_async(url.as_str()) => connected,
            };

            match connected {
                Ok((socket, _)) => {
                    self.transition(ConnectionState::Connected)?;
                    info!(url = %url, "stream connected");
                    let end = self.session(socket, &cancel, &mut on_event).await;
                    self.transition(ConnectionState::Disconnected)?;
                    if let SessionEnd::Cancelled = end {
                        return Ok(());
                    }
                    warn!(delay = ?self.reconnect_delay, "stream lost, reconnecting");
                }
                Err(e) => {
                    self.transition(ConnectionState::Disconnected)?;
                    warn!(error = %e, delay = ?self.reconnect_delay, "stream connect failed");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }

    /// Trees to replay after a (re)connect.
    async fn replay_targets(&self) -> Result<Vec<TreeId>> {
        match self.tree_id {
            Some(tree_id) => Ok(vec![tree_id]),
            None => Ok(self
                .api
                .trees()
                .await?
                .all_trees
                .into_iter()
                .map(|summary| summary.tree_id)
                .collect()),
        }
    }

    /// Fetch what was missed while disconnected. Runs after the socket is
    /// up so nothing falls between replay and live delivery.
    async fn resume<F: FnMut(Event)>(&mut self, on_event: &mut F) -> Result<()> {
        for tree_id in self.replay_targets().await? {
            let since = self.cursors.get(&Some(tree_id)).copied().unwrap_or(0);
            let missed = self.api.messages(tree_id, since).await?;
            for event in missed.events {
                if let Some(event) = self.accept(event) {
                    on_event(event);
                }
            }
        }
        Ok(())
    }

    async fn session<F: FnMut(Event)>(
        &mut self,
        socket: WsStream,
        cancel: &CancellationToken,
        on_event: &mut F,
    ) -> SessionEnd {
        let (mut write, mut read) = socket.split();

        if let Err(e) = self.resume(on_event).await {
            warn!(error = %e, "replay after connect failed");
            return SessionEnd::Lost;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else { continue };
                    let text = match serde_json::to_string(&command) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "failed to encode command");
                            continue;
                        }
                    };
                    if write.send(Message::Text(text)).await.is_err() {
                        return SessionEnd::Lost;
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<Event>(&text) {
                        Ok(event) => {
                            if let Some(event) = self.accept(event) {
                                on_event(event);
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping undecodable event frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "stream transport error");
                        return SessionEnd::Lost;
                    }
                },
            }
        }
    }
}
