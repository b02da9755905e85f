//! Session history priming.
//!
//! A proxy that wants a new session to start with earlier conversation
//! attaches it to `session/new` under `_meta.symposium.history`. Agents that
//! cannot consume that field get it replayed as a single synthetic prompt.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::capabilities::{META, SYMPOSIUM};

pub const HISTORY: &str = "history";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    /// Either a plain string or a list of ACP content blocks.
    pub content: Value,
}

/// Remove the history attached to `session/new` params, if any.
///
/// Malformed history is dropped with a warning rather than forwarded.
pub fn take_history(params: &mut Value) -> Option<Vec<HistoryEntry>> {
    let symposium = params.get_mut(META)?.get_mut(SYMPOSIUM)?.as_object_mut()?;
    let raw = symposium.remove(HISTORY)?;
    if symposium.is_empty() {
        if let Some(meta) = params.get_mut(META).and_then(Value::as_object_mut) {
            meta.remove(SYMPOSIUM);
            if meta.is_empty() {
                if let Some(map) = params.as_object_mut() {
                    map.remove(META);
                }
            }
        }
    }
    match serde_json::from_value(raw) {
        Ok(history) => Some(history),
        Err(error) => {
            tracing::warn!(%error, "ignoring malformed session history");
            None
        }
    }
}

pub fn has_history(params: &Value) -> bool {
    params
        .get(META)
        .and_then(|meta| meta.get(SYMPOSIUM))
        .and_then(|symposium| symposium.get(HISTORY))
        .is_some()
}

fn content_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| match block.get("type").and_then(Value::as_str) {
                Some("text") => block.get("text").and_then(Value::as_str).map(str::to_string),
                _ => Some(block.to_string()),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

/// Render history as the text of one prompt.
pub fn render(history: &[HistoryEntry]) -> String {
    let mut text = String::from(
        "The following is the earlier conversation of this session. \
         Treat it as context for what comes next; no reply is needed.\n",
    );
    for entry in history {
        text.push_str(&format!("\n[{}]\n{}\n", entry.role, content_text(&entry.content)));
    }
    text
}

/// Params of the synthetic `session/prompt` that replays `history`.
pub fn priming_prompt(session_id: &str, history: &[HistoryEntry]) -> Value {
    json!({
        "sessionId": session_id,
        "prompt": [{"type": "text", "text": render(history)}]
    })
}
