//! Inbound messages on the event stream.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::TaskId;
use crate::error::{Error, Result};
use crate::orchestration::{ContinueOutcome, Orchestrator};

/// The only command a stream client can send, plus a catch-all for
/// well-formed messages of any other type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ContinueStep { task_id: TaskId },
    #[serde(other)]
    Unknown,
}

/// Parse one text frame.
///
/// # Errors
/// `Transport` if the frame is not a JSON object with a known shape.
pub fn parse_client_message(text: &str) -> Result<ClientMessage> {
    serde_json::from_str(text).map_err(|e| Error::Transport(format!("malformed message: {}", e)))
}

/// Act on one text frame. Bad frames are logged and dropped; the
/// connection is never closed because of them.
pub(super) fn handle_text(orchestrator: &Orchestrator, text: &str) {
    let message = match parse_client_message(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "dropping inbound message");
            return;
        }
    };

    match message {
        ClientMessage::ContinueStep { task_id } => match orchestrator.continue_task(task_id) {
            Ok(ContinueOutcome::Resumed) => debug!(%task_id, "continue_step accepted"),
            Ok(outcome) => debug!(%task_id, ?outcome, "continue_step had no effect"),
            Err(e) => warn!(%task_id, error = %e, "continue_step failed"),
        },
        ClientMessage::Unknown => warn!(text, "dropping inbound message of unknown type"),
    }
}
