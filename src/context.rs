//! Rolling conversational context shared across utterances.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Lines retained; oldest evicted first.
const CONTEXT_CAPACITY: usize = 10;

/// Bounded ring of recent user/agent lines, used to ground follow-up
/// interpretation ("make it Firefox" after "open Chrome").
#[derive(Debug, Default)]
pub struct SessionContext {
    lines: Mutex<VecDeque<String>>,
}

impl SessionContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, text: &str) {
        self.push(format!("User: {text}"));
    }

    pub fn add_agent(&self, text: &str) {
        self.push(format!("Agent: {text}"));
    }

    fn push(&self, line: String) {
        let mut lines = self
            .lines
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if lines.len() == CONTEXT_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Newline-joined transcript, oldest first. Empty string when fresh.
    #[must_use]
    pub fn transcript(&self) -> String {
        let lines = self
            .lines
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}
