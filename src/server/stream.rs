//! WebSocket event stream.
//!
//! Pushes every matching event as a JSON text frame and reads
//! `continue_step` commands from the same socket.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::core::{EventFilter, TreeId};
use crate::error::Error;
use crate::orchestration::Orchestrator;

use super::protocol::handle_text;
use super::{ApiError, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Restrict to one tree. All trees when absent.
    pub tree_id: Option<String>,
    /// Start with that tree's events after this sequence.
    pub since: Option<u64>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let orchestrator = state.orchestrator().await?.clone();

    let filter = match query.tree_id.as_deref() {
        Some(raw) => {
            let tree_id: TreeId = raw.parse().map_err(|e| {
                ApiError(Error::Validation(format!("invalid tree id {:?}: {}", raw, e)))
            })?;
            orchestrator.tree_status(tree_id)?;
            EventFilter::tree(tree_id)
        }
        None => EventFilter::all(),
    };

    Ok(ws.on_upgrade(move |socket| stream_events(socket, orchestrator, filter, query.since)))
}

async fn stream_events(
    socket: WebSocket,
    orchestrator: Orchestrator,
    filter: EventFilter,
    since: Option<u64>,
) {
    let mut subscription = match since {
        Some(since) if filter.tree_id.is_some() => orchestrator.subscribe_from(filter, since),
        _ => orchestrator.subscribe(filter),
    };
    let (mut sender, mut receiver) = socket.split();
    debug!(tree_id = ?filter.tree_id, "stream connected");

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "failed to encode event");
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => handle_text(&orchestrator, text.as_str()),
                Some(Ok(Message::Binary(_))) => warn!("dropping binary inbound frame"),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "stream transport error");
                    break;
                }
            },
        }
    }
    debug!(tree_id = ?filter.tree_id, "stream closed");
}
