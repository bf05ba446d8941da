//! Conversation history for the executor model.
//!
//! Messages are sequences of typed content blocks. Tool-use blocks pair
//! with tool-result replies by id; history trimming bounds the number of
//! images the model sees without disturbing any other block.

use crate::screen::Screenshot;
use base64::Engine as _;
use serde_json::{Value, json};

/// Placeholder substituted for images evicted by trimming.
pub const SCREENSHOT_OMITTED: &str = "[screenshot omitted]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Content inside a tool-result block.
#[derive(Debug, Clone)]
pub enum ToolResultContent {
    Text { text: String },
    Image { png: Vec<u8> },
}

/// One typed content block.
#[derive(Debug, Clone)]
pub enum ContentBlock {
    Text { text: String },
    Image { png: Vec<u8> },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: Vec<ToolResultContent> },
}

/// One message in the executor conversation.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    #[must_use]
    pub fn user_text(text: &str) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.to_owned() }],
        }
    }

    /// A user message carrying text plus a screenshot.
    #[must_use]
    pub fn user_with_screenshot(text: &str, shot: &Screenshot) -> Self {
        Self {
            role: Role::User,
            content: vec![
                ContentBlock::Text { text: text.to_owned() },
                ContentBlock::Image { png: shot.png.clone() },
            ],
        }
    }

    #[must_use]
    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// Wire representation for the chat-completion endpoint.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        let blocks: Vec<Value> = self.content.iter().map(block_to_wire).collect();
        json!({ "role": self.role.as_str(), "content": blocks })
    }
}

fn png_source(png: &[u8]) -> Value {
    json!({
        "type": "base64",
        "media_type": "image/png",
        "data": base64::engine::general_purpose::STANDARD.encode(png),
    })
}

fn block_to_wire(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
        ContentBlock::Image { png } => json!({ "type": "image", "source": png_source(png) }),
        ContentBlock::ToolUse { id, name, input } => {
            json!({ "type": "tool_use", "id": id, "name": name, "input": input })
        }
        ContentBlock::ToolResult { tool_use_id, content } => {
            let inner: Vec<Value> = content
                .iter()
                .map(|c| match c {
                    ToolResultContent::Text { text } => json!({ "type": "text", "text": text }),
                    ToolResultContent::Image { png } => {
                        json!({ "type": "image", "source": png_source(png) })
                    }
                })
                .collect();
            json!({ "type": "tool_result", "tool_use_id": tool_use_id, "content": inner })
        }
    }
}

/// Replace all but the newest `max_images` images with a text placeholder.
///
/// Counts both standalone image blocks and images inside tool-results;
/// every other block is preserved untouched.
pub fn trim_history(messages: &mut [Message], max_images: usize) {
    let mut kept = 0usize;
    for message in messages.iter_mut().rev() {
        for block in message.content.iter_mut().rev() {
            match block {
                ContentBlock::Image { .. } => {
                    if kept < max_images {
                        kept += 1;
                    } else {
                        *block = ContentBlock::Text { text: SCREENSHOT_OMITTED.to_owned() };
                    }
                }
                ContentBlock::ToolResult { content, .. } => {
                    for item in content.iter_mut().rev() {
                        if matches!(item, ToolResultContent::Image { .. }) {
                            if kept < max_images {
                                kept += 1;
                            } else {
                                *item = ToolResultContent::Text {
                                    text: SCREENSHOT_OMITTED.to_owned(),
                                };
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

/// Count images anywhere in the history.
#[must_use]
pub fn image_count(messages: &[Message]) -> usize {
    messages
        .iter()
        .flat_map(|m| m.content.iter())
        .map(|block| match block {
            ContentBlock::Image { .. } => 1,
            ContentBlock::ToolResult { content, .. } => content
                .iter()
                .filter(|c| matches!(c, ToolResultContent::Image { .. }))
                .count(),
            _ => 0,
        })
        .sum()
}
