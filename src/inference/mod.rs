//! Streaming client for the remote inference backend.
//!
//! Speaks a chat-completion endpoint with server-sent events. The blocking
//! HTTP client runs on the blocking pool and forwards parsed events over a
//! channel, so async consumers see a plain event stream.

pub mod messages;
pub mod stream;

use crate::config::InferenceConfig;
use crate::error::{AgentError, Result};
use messages::Message;
use serde_json::{Value, json};
use std::io::BufRead;
use stream::{ModelTurn, StreamEvent, TurnCollector};
use tokio::sync::mpsc;
use tracing::debug;

/// Wire protocol version header.
const API_VERSION: &str = "2023-06-01";

/// Channel depth for streamed events.
const EVENT_CHANNEL_SIZE: usize = 64;

/// One chat-completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub max_tokens: u32,
    pub messages: Vec<Message>,
    /// Tool definitions; `None` for JSON-only planner calls.
    pub tools: Option<Vec<Value>>,
}

/// HTTP client for the inference backend.
pub struct InferenceClient {
    agent: ureq::Agent,
    api_url: String,
    api_key: String,
}

impl InferenceClient {
    #[must_use]
    pub fn new(config: &InferenceConfig) -> Self {
        Self {
            agent: ureq::agent(),
            api_url: config.api_url.clone(),
            api_key: config.effective_api_key(),
        }
    }

    /// Build the request body. The system block carries the ephemeral
    /// cache marker so repeated turns reuse the prompt prefix.
    fn build_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(Message::to_wire).collect();
        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "system": [{
                "type": "text",
                "text": request.system,
                "cache_control": { "type": "ephemeral" },
            }],
            "messages": messages,
            "stream": stream,
        });
        if let Some(ref tools) = request.tools {
            body["tools"] = json!(tools);
        }
        body
    }

    /// Stream a response. Events arrive in order; the channel closes after
    /// `message_stop` or on error.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be serialized. Transport
    /// failures surface as `Err` items on the channel.
    pub fn stream(&self, request: &ChatRequest) -> Result<mpsc::Receiver<Result<StreamEvent>>> {
        let body = self.build_body(request, true);
        let body_str = serde_json::to_string(&body)
            .map_err(|e| AgentError::Parse(format!("request serialization failed: {e}")))?;

        let agent = self.agent.clone();
        let url = self.api_url.clone();
        let api_key = self.api_key.clone();
        let (tx, rx) = mpsc::channel::<Result<StreamEvent>>(EVENT_CHANNEL_SIZE);

        tokio::task::spawn_blocking(move || {
            let response = agent
                .post(&url)
                .set("content-type", "application/json")
                .set("x-api-key", &api_key)
                .set("anthropic-version", API_VERSION)
                .send_string(&body_str);

            let response = match response {
                Ok(r) => r,
                Err(ureq::Error::Status(code, r)) => {
                    let detail = r.into_string().unwrap_or_default();
                    let _ = tx.blocking_send(Err(AgentError::Network(format!(
                        "HTTP {code}: {detail}"
                    ))));
                    return;
                }
                Err(e) => {
                    let _ = tx.blocking_send(Err(AgentError::Network(format!(
                        "request failed: {e}"
                    ))));
                    return;
                }
            };

            let reader = std::io::BufReader::new(response.into_reader());
            let mut event_name = String::new();
            for line in reader.lines() {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        let _ = tx
                            .blocking_send(Err(AgentError::Network(format!("stream cut: {e}"))));
                        return;
                    }
                };
                if let Some(name) = line.strip_prefix("event: ") {
                    event_name = name.trim().to_owned();
                    continue;
                }
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                match stream::parse_event(&event_name, data) {
                    Ok(Some(event)) => {
                        let stop = matches!(event, StreamEvent::MessageStop);
                        if tx.blocking_send(Ok(event)).is_err() {
                            return;
                        }
                        if stop {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let _ = tx.blocking_send(Err(e));
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    /// Run a request to completion, collecting the streamed events into one
    /// [`ModelTurn`].
    ///
    /// # Errors
    ///
    /// Returns the first transport or parse error seen on the stream.
    pub async fn complete(&self, request: &ChatRequest) -> Result<ModelTurn> {
        let mut rx = self.stream(request)?;
        let mut collector = TurnCollector::new();
        while let Some(event) = rx.recv().await {
            collector.push(&event?);
        }
        let turn = collector.finish();
        debug!(
            "turn complete: {} chars, {} tool calls, stop={:?}",
            turn.text.len(),
            turn.tool_calls.len(),
            turn.stop_reason
        );
        Ok(turn)
    }
}

/// Tool definition for the fixed computer-control tool, parameterized by
/// the bitmap dimensions the model is told it sees.
#[must_use]
pub fn computer_tool(bitmap_w: u32, bitmap_h: u32) -> Value {
    json!({
        "name": "computer",
        "description": format!(
            "Control the user's computer with mouse and keyboard. \
             The screen is {bitmap_w}x{bitmap_h} pixels."
        ),
        "input_schema": {
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": [
                        "left_click", "right_click", "double_click", "middle_click",
                        "type", "key", "scroll", "mouse_move", "left_click_drag",
                        "screenshot", "cursor_position"
                    ],
                },
                "coordinate": {
                    "type": "array",
                    "items": { "type": "integer" },
                    "description": "[x, y] target in screen pixels",
                },
                "start_coordinate": {
                    "type": "array",
                    "items": { "type": "integer" },
                    "description": "[x, y] drag origin",
                },
                "text": { "type": "string" },
                "key": { "type": "string" },
                "scroll_direction": {
                    "type": "string",
                    "enum": ["up", "down", "left", "right"],
                },
                "scroll_amount": { "type": "integer", "default": 3 },
            },
            "required": ["action"],
        },
    })
}
