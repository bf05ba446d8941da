//! Fast-path executor: stream the tool-calling model, act, repeat.
//!
//! Each round streams one model response, watching the text as it forms so
//! guidance highlights and narration start before the response completes.
//! Tool batches run with settle delays, then a fresh screenshot closes the
//! round. The loop terminates on the `DONE:`/`CLARIFY:` protocol prefixes,
//! or escalates to the planner when it runs out of rounds.

use crate::action::{ActionSink, ClickTracker, ScreenAction};
use crate::config::{ExecutorConfig, InferenceConfig};
use crate::inference::messages::{ContentBlock, Message, Role, ToolResultContent, trim_history};
use crate::inference::stream::{ModelTurn, ToolCall, TurnCollector};
use crate::inference::{ChatRequest, InferenceClient, computer_tool};
use crate::narration::NarrationQueue;
use crate::overlay;
use crate::perf::PerfGuard;
use crate::screen::{ScaleMap, Screenshot, ScreenSource};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Protocol prefixes the executor may emit at the start of its text.
const SIGNAL_PREFIXES: [&str; 4] = ["GUIDE:", "NARRATE:", "DONE:", "CLARIFY:"];

/// History note appended after a guidance round.
const GUIDED_NOTE: &str = "The user was guided. Here is the current screen. Continue helping.";

const EXECUTOR_SYSTEM_PROMPT: &str = "\
You control the user's computer to complete their spoken request. Use the \
`computer` tool for mouse and keyboard actions. Prefer keyboard shortcuts \
and app launchers over hunting for icons.

Signal prefixes, at most one per response:
- NARRATE: <8 words or fewer> - say what you are doing, then call tools.
- GUIDE: (x, y) <instruction> - point the user at a spot instead of acting.
- DONE: <10 words or fewer> - the request is complete.
- CLARIFY: <question> - you need an answer before continuing.

Keep plain text short; it may be spoken aloud.";

/// Terminal outcome of a direct-execution loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectOutcome {
    /// Request finished; the summary is spoken to the user.
    Done(String),
    /// The model needs an answer before continuing.
    Clarify(String),
    /// Out of rounds or the model call failed; hand off to the planner.
    Escalate,
    Cancelled,
}

/// Drives the tool-calling executor model against the live screen.
pub struct Executor {
    client: Arc<InferenceClient>,
    screen: Arc<dyn ScreenSource>,
    sink: Arc<dyn ActionSink>,
    narration: Arc<NarrationQueue>,
    config: ExecutorConfig,
    inference: InferenceConfig,
    /// First successful batch of the session maximizes the focused window.
    maximized_once: AtomicBool,
}

impl Executor {
    #[must_use]
    pub fn new(
        client: Arc<InferenceClient>,
        screen: Arc<dyn ScreenSource>,
        sink: Arc<dyn ActionSink>,
        narration: Arc<NarrationQueue>,
        config: ExecutorConfig,
        inference: InferenceConfig,
    ) -> Self {
        Self {
            client,
            screen,
            sink,
            narration,
            config,
            inference,
            maximized_once: AtomicBool::new(false),
        }
    }

    /// The round-one request for `user_text` against `shot`. Also used by
    /// the speculative dispatcher to fire early on a stable partial.
    #[must_use]
    pub fn initial_request(&self, user_text: &str, shot: &Screenshot) -> ChatRequest {
        self.request(&[Message::user_with_screenshot(user_text, shot)], shot)
    }

    fn request(&self, history: &[Message], shot: &Screenshot) -> ChatRequest {
        ChatRequest {
            model: self.inference.executor_model.clone(),
            system: EXECUTOR_SYSTEM_PROMPT.to_owned(),
            max_tokens: self.inference.max_tokens,
            messages: history.to_vec(),
            tools: Some(vec![computer_tool(shot.bitmap_w, shot.bitmap_h)]),
        }
    }

    /// Run the direct-execution loop for a fresh request.
    pub async fn run_direct(
        &self,
        user_text: &str,
        shot: Screenshot,
        max_iterations: usize,
        cancel: &CancellationToken,
        perf: Option<&PerfGuard>,
    ) -> DirectOutcome {
        let mut history = vec![Message::user_with_screenshot(user_text, &shot)];
        self.drive(&mut history, shot, None, max_iterations, cancel, perf)
            .await
    }

    /// Continue the loop from a claimed speculative turn: its tool calls
    /// execute immediately, skipping the first model round.
    pub async fn run_claimed(
        &self,
        claimed: ModelTurn,
        user_text: &str,
        shot: Screenshot,
        cancel: &CancellationToken,
        perf: Option<&PerfGuard>,
    ) -> DirectOutcome {
        let mut history = vec![Message::user_with_screenshot(user_text, &shot)];
        self.drive(
            &mut history,
            shot,
            Some(claimed),
            self.config.max_direct_iterations,
            cancel,
            perf,
        )
        .await
    }

    async fn drive(
        &self,
        history: &mut Vec<Message>,
        mut shot: Screenshot,
        mut pending_turn: Option<ModelTurn>,
        max_iterations: usize,
        cancel: &CancellationToken,
        perf: Option<&PerfGuard>,
    ) -> DirectOutcome {
        let mut clicks = ClickTracker::new();

        for round in 0..max_iterations {
            if cancel.is_cancelled() {
                return DirectOutcome::Cancelled;
            }
            trim_history(history, self.config.max_screenshots);

            let turn = match pending_turn.take() {
                Some(turn) => turn,
                None => match self.stream_round(history, &shot, cancel).await {
                    Ok(turn) => turn,
                    Err(StreamAbort::Cancelled) => return DirectOutcome::Cancelled,
                    Err(StreamAbort::Failed) => return DirectOutcome::Escalate,
                },
            };

            // Full-text scan: signals may appear anywhere, not only at the
            // start, and DONE/CLARIFY outrank GUIDE.
            if let Some(summary) = find_signal(&turn.text, "DONE:") {
                return DirectOutcome::Done(summary);
            }
            if let Some(question) = find_signal(&turn.text, "CLARIFY:") {
                return DirectOutcome::Clarify(question);
            }
            if let Some((x, y, instruction)) = find_last_guide(&turn.text) {
                history.push(assistant_message(&turn));
                match self.guide_round(x, y, &instruction, &shot).await {
                    Ok(new_shot) => {
                        history.push(Message::user_with_screenshot(GUIDED_NOTE, &new_shot));
                        shot = new_shot;
                    }
                    Err(e) => {
                        warn!("guide round failed: {e}");
                        return DirectOutcome::Done("Lost screen access.".to_owned());
                    }
                }
                continue;
            }

            if turn.tool_calls.is_empty() {
                // The model chose words over actions.
                let text = turn.text.trim().to_owned();
                if text.contains('?') {
                    return DirectOutcome::Clarify(text);
                }
                return DirectOutcome::Done(text);
            }

            let had_tools = turn.stop_reason.as_deref() == Some("tool_use");
            history.push(assistant_message(&turn));
            match self
                .execute_batch(&turn.tool_calls, &shot, &mut clicks, cancel, perf)
                .await
            {
                Ok((results, new_shot)) => {
                    history.push(Message { role: Role::User, content: results });
                    shot = new_shot;
                }
                Err(BatchAbort::Cancelled) => return DirectOutcome::Cancelled,
                Err(BatchAbort::ScreenLost) => {
                    return DirectOutcome::Done("Lost screen access.".to_owned());
                }
            }

            if !had_tools {
                // Tool calls without a tool_use stop reason: the model is
                // wrapping up; one more round lets it confirm.
                info!("round {round} ran tools without tool_use stop reason");
            }
        }
        DirectOutcome::Escalate
    }

    /// Stream one model round, reacting to text as it forms.
    async fn stream_round(
        &self,
        history: &[Message],
        shot: &Screenshot,
        cancel: &CancellationToken,
    ) -> std::result::Result<ModelTurn, StreamAbort> {
        let request = self.request(history, shot);
        let mut rx = match self.client.stream(&request) {
            Ok(rx) => rx,
            Err(e) => {
                warn!("stream request failed: {e}");
                return Err(StreamAbort::Failed);
            }
        };

        let mut collector = TurnCollector::new();
        let mut narrated = false;
        let mut guide_shown = false;
        let scale = shot.scale();

        loop {
            let item = tokio::select! {
                () = cancel.cancelled() => return Err(StreamAbort::Cancelled),
                item = rx.recv() => item,
            };
            let Some(item) = item else { break };
            match item {
                Ok(event) => {
                    if collector.push(&event).is_some() {
                        self.on_stream_text(collector.text(), &mut narrated, &mut guide_shown, scale);
                    }
                }
                Err(e) => {
                    warn!("model stream failed mid-response: {e}");
                    return Err(StreamAbort::Failed);
                }
            }
        }
        Ok(collector.finish())
    }

    /// React to partially-streamed text: live GUIDE highlight, and
    /// first-sentence narration for plain responses.
    fn on_stream_text(
        &self,
        text: &str,
        narrated: &mut bool,
        guide_shown: &mut bool,
        scale: ScaleMap,
    ) {
        let trimmed = text.trim_start();

        if trimmed.starts_with("GUIDE:") && !*guide_shown {
            if let Some((x, y, instruction)) = parse_guide(trimmed) {
                let (sx, sy) = scale.to_screen(x, y);
                if let Some(overlay) = overlay::handle() {
                    overlay.show_highlight(sx, sy, &instruction);
                }
                *guide_shown = true;
            }
        }

        if *narrated {
            return;
        }
        if could_become_signal(trimmed) {
            return;
        }
        if trimmed.starts_with("DONE:")
            || trimmed.starts_with("CLARIFY:")
            || trimmed.starts_with("GUIDE:")
        {
            // These have their own speech paths.
            *narrated = true;
            return;
        }
        let speakable = trimmed.strip_prefix("NARRATE:").unwrap_or(trimmed);
        if let Some(sentence) = complete_first_sentence(speakable) {
            self.narration.enqueue(sentence.trim());
            *narrated = true;
        }
    }

    /// A guidance round: highlight, speak, pause, recapture.
    async fn guide_round(
        &self,
        x: i32,
        y: i32,
        instruction: &str,
        shot: &Screenshot,
    ) -> crate::error::Result<Screenshot> {
        let (sx, sy) = shot.scale().to_screen(x, y);
        if let Some(overlay) = overlay::handle() {
            overlay.show_highlight(sx, sy, instruction);
        }
        self.narration.enqueue(instruction);
        sleep(Duration::from_millis(self.config.guide_pause_ms)).await;
        if let Some(overlay) = overlay::handle() {
            overlay.clear();
        }
        self.screen.capture()
    }

    /// Execute every tool call in order, then settle and recapture.
    ///
    /// Every tool-use id receives a text acknowledgement; the last result
    /// additionally carries the fresh screenshot, and the repeat-click
    /// warning when it fires.
    async fn execute_batch(
        &self,
        calls: &[ToolCall],
        shot: &Screenshot,
        clicks: &mut ClickTracker,
        cancel: &CancellationToken,
        perf: Option<&PerfGuard>,
    ) -> std::result::Result<(Vec<ContentBlock>, Screenshot), BatchAbort> {
        let scale = shot.scale();
        let mut acks: Vec<(String, String)> = Vec::with_capacity(calls.len());
        let mut warning: Option<&'static str> = None;

        for call in calls {
            if cancel.is_cancelled() {
                return Err(BatchAbort::Cancelled);
            }
            let ack = match ScreenAction::parse(&call.input) {
                None => {
                    warn!("unknown action in tool input: {}", call.input);
                    "Unrecognized action; ignored.".to_owned()
                }
                Some(ScreenAction::Screenshot) => {
                    "Screenshot attached to this result.".to_owned()
                }
                Some(ScreenAction::CursorPosition) => match self.sink.cursor_position() {
                    Ok((cx, cy)) => format!("Cursor is at ({cx}, {cy})."),
                    Err(e) => format!("Cursor query failed: {e}"),
                },
                Some(action) => {
                    if let Some(perf) = perf {
                        perf.emit_action();
                    }
                    let result = self.sink.perform(&action.to_screen(&scale));
                    if let Err(e) = &result {
                        warn!("action failed: {e}");
                    }
                    if let Some(w) = clicks.observe(&action) {
                        warning = Some(w);
                    }
                    sleep(Duration::from_millis(self.config.action_settle_ms)).await;
                    match result {
                        Ok(()) => "Action performed.".to_owned(),
                        Err(e) => format!("Action failed: {e}"),
                    }
                }
            };
            acks.push((call.id.clone(), ack));
        }

        sleep(Duration::from_millis(self.config.batch_settle_ms)).await;
        let new_shot = self.screen.capture().map_err(|e| {
            warn!("recapture failed after batch: {e}");
            BatchAbort::ScreenLost
        })?;

        if self.config.maximize_on_first_batch
            && !self.maximized_once.swap(true, Ordering::SeqCst)
        {
            if let Err(e) = self.sink.maximize_foreground_window() {
                warn!("maximize after first batch failed: {e}");
            }
        }

        let last = acks.len().saturating_sub(1);
        let results = acks
            .into_iter()
            .enumerate()
            .map(|(i, (id, ack))| {
                let mut content = vec![ToolResultContent::Text { text: ack }];
                if i == last {
                    content.push(ToolResultContent::Image { png: new_shot.png.clone() });
                    if let Some(w) = warning {
                        content.push(ToolResultContent::Text { text: w.to_owned() });
                    }
                }
                ContentBlock::ToolResult { tool_use_id: id, content }
            })
            .collect();
        Ok((results, new_shot))
    }
}

enum StreamAbort {
    Failed,
    Cancelled,
}

enum BatchAbort {
    ScreenLost,
    Cancelled,
}

fn assistant_message(turn: &ModelTurn) -> Message {
    let mut content = Vec::new();
    if !turn.text.is_empty() {
        content.push(ContentBlock::Text { text: turn.text.clone() });
    }
    for call in &turn.tool_calls {
        content.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.input.clone(),
        });
    }
    Message::assistant(content)
}

// ── protocol text scanning ───────────────────────────────────────────

/// Find `tag` anywhere in `text` and return the rest of its line.
fn find_signal(text: &str, tag: &str) -> Option<String> {
    let at = text.find(tag)?;
    let rest = &text[at + tag.len()..];
    let line = rest.lines().next().unwrap_or("").trim();
    Some(line.to_owned())
}

/// Last `GUIDE: (x, y) instruction` occurrence wins.
fn find_last_guide(text: &str) -> Option<(i32, i32, String)> {
    let at = text.rfind("GUIDE:")?;
    parse_guide(&text[at..])
}

/// Parse `GUIDE: (x, y) instruction`.
fn parse_guide(text: &str) -> Option<(i32, i32, String)> {
    let rest = text.strip_prefix("GUIDE:")?.trim_start();
    let open = rest.find('(')?;
    let close = rest[open..].find(')')? + open;
    let inside = &rest[open + 1..close];
    let (x_str, y_str) = inside.split_once(',')?;
    let x: i32 = x_str.trim().parse().ok()?;
    let y: i32 = y_str.trim().parse().ok()?;
    let instruction = rest[close + 1..].lines().next().unwrap_or("").trim().to_owned();
    Some((x, y, instruction))
}

/// True while `text` could still grow into one of the signal prefixes.
fn could_become_signal(text: &str) -> bool {
    SIGNAL_PREFIXES
        .iter()
        .any(|p| p.starts_with(text) && text.len() < p.len())
}

/// The first complete sentence, once a terminator has streamed in.
fn complete_first_sentence(text: &str) -> Option<&str> {
    let end = text.find(['.', '!', '?'])?;
    Some(&text[..=end])
}
