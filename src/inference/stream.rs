//! Server-sent-event parsing and streamed-response assembly.
//!
//! The endpoint emits named events (`message_start`, `content_block_start`,
//! `content_block_delta`, `content_block_stop`, `message_delta`,
//! `message_stop`). Partial tool-call JSON arrives as concatenated
//! `input_json_delta` chunks; each block is buffered and parsed at its
//! `content_block_stop`, and incomplete JSON at end-of-stream drops the
//! block rather than failing the turn.

use crate::error::{AgentError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// One streamed event, already narrowed to what the pipeline consumes.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    MessageStart,
    BlockStart { index: usize, block: StartedBlock },
    TextDelta { index: usize, text: String },
    InputJsonDelta { index: usize, partial_json: String },
    BlockStop { index: usize },
    MessageDelta { stop_reason: Option<String> },
    MessageStop,
}

/// The shape of a content block announced by `content_block_start`.
#[derive(Debug, Clone)]
pub enum StartedBlock {
    Text,
    ToolUse { id: String, name: String },
}

/// Parse one SSE `data:` payload given its `event:` name.
///
/// Unknown event names (`ping` and future additions) return `None`.
pub fn parse_event(event: &str, data: &str) -> Result<Option<StreamEvent>> {
    let payload: Value = serde_json::from_str(data)
        .map_err(|e| AgentError::Parse(format!("bad SSE payload for {event}: {e}")))?;
    let index = payload.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;

    let parsed = match event {
        "message_start" => Some(StreamEvent::MessageStart),
        "content_block_start" => {
            let block = payload.get("content_block").cloned().unwrap_or(Value::Null);
            let started = match block.get("type").and_then(Value::as_str) {
                Some("tool_use") => StartedBlock::ToolUse {
                    id: block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned(),
                    name: block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned(),
                },
                _ => StartedBlock::Text,
            };
            Some(StreamEvent::BlockStart { index, block: started })
        }
        "content_block_delta" => {
            let delta = payload.get("delta").cloned().unwrap_or(Value::Null);
            match delta.get("type").and_then(Value::as_str) {
                Some("text_delta") => Some(StreamEvent::TextDelta {
                    index,
                    text: delta
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned(),
                }),
                Some("input_json_delta") => Some(StreamEvent::InputJsonDelta {
                    index,
                    partial_json: delta
                        .get("partial_json")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned(),
                }),
                _ => None,
            }
        }
        "content_block_stop" => Some(StreamEvent::BlockStop { index }),
        "message_delta" => Some(StreamEvent::MessageDelta {
            stop_reason: payload
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(Value::as_str)
                .map(str::to_owned),
        }),
        "message_stop" => Some(StreamEvent::MessageStop),
        _ => None,
    };
    Ok(parsed)
}

/// One fully-formed tool call.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// One complete model response, streamed or not.
#[derive(Debug, Clone, Default)]
pub struct ModelTurn {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: Option<String>,
}

#[derive(Default)]
struct PendingTool {
    id: String,
    name: String,
    json_buf: String,
    closed: bool,
}

/// Assembles [`StreamEvent`]s into a [`ModelTurn`].
#[derive(Default)]
pub struct TurnCollector {
    text: String,
    tools: BTreeMap<usize, PendingTool>,
    stop_reason: Option<String>,
}

impl TurnCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event. Returns the text delta when the event extends the
    /// streamed text, letting the caller narrate as tokens arrive.
    pub fn push(&mut self, event: &StreamEvent) -> Option<String> {
        match event {
            StreamEvent::BlockStart { index, block: StartedBlock::ToolUse { id, name } } => {
                self.tools.insert(
                    *index,
                    PendingTool {
                        id: id.clone(),
                        name: name.clone(),
                        json_buf: String::new(),
                        closed: false,
                    },
                );
                None
            }
            StreamEvent::TextDelta { text, .. } => {
                self.text.push_str(text);
                Some(text.clone())
            }
            StreamEvent::InputJsonDelta { index, partial_json } => {
                if let Some(tool) = self.tools.get_mut(index) {
                    tool.json_buf.push_str(partial_json);
                }
                None
            }
            StreamEvent::BlockStop { index } => {
                if let Some(tool) = self.tools.get_mut(index) {
                    tool.closed = true;
                }
                None
            }
            StreamEvent::MessageDelta { stop_reason } => {
                if stop_reason.is_some() {
                    self.stop_reason.clone_from(stop_reason);
                }
                None
            }
            _ => None,
        }
    }

    /// Accumulated text so far, for incremental prefix detection.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Finish the turn. Tool blocks whose JSON never closed or does not
    /// parse are dropped with a warning.
    #[must_use]
    pub fn finish(self) -> ModelTurn {
        let mut tool_calls = Vec::new();
        for (index, tool) in self.tools {
            let raw = if tool.json_buf.trim().is_empty() {
                "{}".to_owned()
            } else {
                tool.json_buf
            };
            if !tool.closed {
                warn!("tool block {index} never closed, dropping");
                continue;
            }
            match serde_json::from_str::<Value>(&raw) {
                Ok(input) => tool_calls.push(ToolCall { id: tool.id, name: tool.name, input }),
                Err(e) => warn!("tool block {index} had unparseable input ({e}), dropping"),
            }
        }
        ModelTurn {
            text: self.text,
            tool_calls,
            stop_reason: self.stop_reason,
        }
    }
}
