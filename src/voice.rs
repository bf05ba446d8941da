//! The voice loop: one utterance at a time, from microphone open to
//! spoken result.
//!
//! The loop is the driver for everything else: it mutes narration while
//! listening, routes transcripts (special tokens, clarification answers,
//! simple vs. complex), claims or discards speculative results, launches
//! the action task, and polls its completion box without reopening the
//! microphone so narration plays uninterrupted.

use crate::clarify::ClarificationBridge;
use crate::config::AgentConfig;
use crate::context::SessionContext;
use crate::error::Result;
use crate::executor::{DirectOutcome, Executor};
use crate::inference::messages::Message;
use crate::inference::{ChatRequest, InferenceClient};
use crate::memory::MemoryStore;
use crate::narration::NarrationQueue;
use crate::perf::{PerfGuard, PerfTracker};
use crate::planner::PlannerPipeline;
use crate::screen::{Screenshot, ScreenSource};
use crate::session_log::SessionLog;
use crate::speculative::SpeculativeDispatcher;
use crate::stt::{StablePartialFn, SttProvider};
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Process-wide utterance counter. Ids are consumed only by utterances
/// that produce a non-empty transcript.
static NEXT_UTTERANCE_ID: AtomicU64 = AtomicU64::new(0);

/// Settle after muting narration, before the microphone opens.
const MUTE_SETTLE: Duration = Duration::from_millis(300);

/// Poll interval on the task completion box.
const DONE_POLL: Duration = Duration::from_millis(200);

/// Longest hold for the completion summary to finish speaking.
const SUMMARY_DRAIN: Duration = Duration::from_secs(5);

/// Spoken immediately on the simple path while the model thinks.
const FILLERS: &[&str] = &["On it.", "Sure.", "Let me do that.", "Got it.", "One moment."];

const INTERPRETER_SYSTEM_PROMPT: &str = "\
You interpret a spoken input to a computer-use assistant, using the recent \
conversation and known facts about the user. Classify it and respond with \
JSON only:
{\"type\": \"command\" | \"followup\" | \"interrupt\" | \"chat\" | \"memory\",
 \"directive\": \"imperative rewrite for the executor (command/followup)\",
 \"response\": \"short sentence to speak back\",
 \"remember\": \"fact to store (memory only)\"}
A followup rewrites the input against the conversation, e.g. \
\"actually, make it Firefox\" after opening Chrome becomes \
\"Open Firefox instead of Chrome\".";

// ── routing ──────────────────────────────────────────────────────────

/// Single-word markers that flag contextual input.
const MARKER_WORDS: &[&str] = &["actually", "instead", "rather", "hmm"];

/// Phrase markers that flag contextual input.
const MARKER_PHRASES: &[&str] = &[
    "remember that",
    "always use",
    "i prefer",
    "i like to",
    "tell me about",
    "explain what",
];

/// A transcript is "complex" iff it carries a contextual marker; everything
/// else takes the fast path straight to the executor.
#[must_use]
pub fn is_simple_command(text: &str) -> bool {
    let lower = text.to_lowercase();
    if lower.trim_start().starts_with("remember ") {
        return false;
    }
    if lower
        .split(|c: char| !c.is_alphanumeric())
        .any(|token| MARKER_WORDS.contains(&token))
    {
        return false;
    }
    if MARKER_PHRASES.iter().any(|p| lower.contains(p)) {
        return false;
    }
    for question in ["what", "how", "why"] {
        for verb in ["did", "was", "were", "are"] {
            if lower.contains(&format!("{question} {verb}")) {
                return false;
            }
        }
    }
    true
}

/// Collapse stray spaces STT leaves inside spoken email addresses:
/// `john 123@gmail. com` becomes `john123@gmail.com`.
#[must_use]
pub fn fix_email_spacing(text: &str) -> String {
    let mut tokens: Vec<String> = text.split_whitespace().map(str::to_owned).collect();
    let mut i = 0;
    while i < tokens.len() {
        if !tokens[i].contains('@') {
            i += 1;
            continue;
        }

        // Digits (or nothing) split off the local part rejoin leftward.
        while i > 0 {
            let local = tokens[i].split('@').next().unwrap_or("");
            let prev_ends_alpha = tokens[i - 1]
                .chars()
                .last()
                .is_some_and(|c| c.is_ascii_alphanumeric());
            let rejoin = local.is_empty() || local.chars().next().is_some_and(|c| c.is_ascii_digit());
            if rejoin && prev_ends_alpha {
                let prev = tokens.remove(i - 1);
                i -= 1;
                tokens[i] = format!("{prev}{}", tokens[i]);
            } else {
                break;
            }
        }

        // Domain fragments rejoin rightward until the domain looks whole.
        loop {
            let Some(next) = tokens.get(i + 1) else { break };
            if !looks_like_domain_fragment(next) {
                break;
            }
            let current = &tokens[i];
            let domain = current.split('@').nth(1).unwrap_or("");
            let dangling_dot = current.ends_with('.')
                && !domain[..domain.len().saturating_sub(1)].contains('.');
            let join = current.ends_with('@')
                || dangling_dot
                || next.starts_with('.')
                || !domain.contains('.');
            if !join {
                break;
            }
            let next = tokens.remove(i + 1);
            tokens[i].push_str(&next);
        }
        i += 1;
    }
    tokens.join(" ")
}

fn looks_like_domain_fragment(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= 24
        && token
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.')
}

// ── interpreter ──────────────────────────────────────────────────────

/// Interpreter verdict for contextual input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interpretation {
    Command { directive: String, response: String },
    Followup { directive: String, response: String },
    Interrupt { response: String },
    Chat { response: String },
    Memory { remember: String, response: String },
}

#[derive(Deserialize)]
struct WireInterpretation {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    directive: String,
    #[serde(default)]
    response: String,
    #[serde(default)]
    remember: String,
}

/// Ask the planner model what a contextual input means.
///
/// # Errors
///
/// Returns an error on transport failure or unparseable output; the caller
/// falls back to the simple path.
pub async fn interpret_voice_input(
    client: &InferenceClient,
    model: &str,
    max_tokens: u32,
    raw: &str,
    context: &str,
    facts: &[String],
) -> Result<Interpretation> {
    let prompt = format!(
        "Recent conversation:\n{}\n\nKnown facts:\n{}\n\nSpoken input: {raw}",
        if context.is_empty() { "(none)" } else { context },
        if facts.is_empty() { "(none)".to_owned() } else { facts.join("\n") },
    );
    let request = ChatRequest {
        model: model.to_owned(),
        system: INTERPRETER_SYSTEM_PROMPT.to_owned(),
        max_tokens,
        messages: vec![Message::user_text(&prompt)],
        tools: None,
    };
    let turn = client.complete(&request).await?;
    let wire: WireInterpretation = crate::planner::parse_json_response(&turn.text)?;
    Ok(match wire.kind.as_str() {
        "followup" => Interpretation::Followup { directive: wire.directive, response: wire.response },
        "interrupt" => Interpretation::Interrupt { response: wire.response },
        "chat" => Interpretation::Chat { response: wire.response },
        "memory" => Interpretation::Memory { remember: wire.remember, response: wire.response },
        _ => Interpretation::Command { directive: wire.directive, response: wire.response },
    })
}

// ── task plumbing ────────────────────────────────────────────────────

/// Completion flag polled by the voice loop while the action task runs.
#[derive(Clone, Default)]
pub struct TaskCompletionBox {
    inner: Arc<Mutex<Option<String>>>,
}

impl TaskCompletionBox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self, summary: &str) {
        let mut slot = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(summary.to_owned());
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_some()
    }

    #[must_use]
    pub fn summary(&self) -> Option<String> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

/// The in-flight action task owned by the voice loop.
struct ActionTask {
    cancel: CancellationToken,
    done: TaskCompletionBox,
}

impl ActionTask {
    fn cancel(&self) {
        self.cancel.cancel();
        self.done.complete("Cancelled.");
    }
}

/// Strip signal prefixes off a speculative response so the remainder can
/// be spoken as narration.
fn speakable_narration(text: &str) -> Option<String> {
    let mut rest = text.trim();
    for prefix in ["NARRATE:", "GUIDE:", "DONE:", "CLARIFY:"] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped.trim_start();
        }
    }
    let line = rest.lines().next().unwrap_or("").trim();
    if line.is_empty() { None } else { Some(line.to_owned()) }
}

// ── the loop ─────────────────────────────────────────────────────────

/// Owns the microphone, the narration queue, and one action task at a time.
pub struct VoiceManager {
    stt: Box<dyn SttProvider>,
    narration: Arc<NarrationQueue>,
    dispatcher: Arc<SpeculativeDispatcher>,
    bridge: Arc<ClarificationBridge>,
    executor: Arc<Executor>,
    pipeline: Arc<PlannerPipeline>,
    client: Arc<InferenceClient>,
    screen: Arc<dyn ScreenSource>,
    context: Arc<SessionContext>,
    memory: Arc<MemoryStore>,
    perf: Arc<PerfTracker>,
    session_log: Arc<SessionLog>,
    config: AgentConfig,
    shutdown: CancellationToken,
    current: Option<ActionTask>,
}

impl VoiceManager {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stt: Box<dyn SttProvider>,
        narration: Arc<NarrationQueue>,
        dispatcher: Arc<SpeculativeDispatcher>,
        bridge: Arc<ClarificationBridge>,
        executor: Arc<Executor>,
        pipeline: Arc<PlannerPipeline>,
        client: Arc<InferenceClient>,
        screen: Arc<dyn ScreenSource>,
        context: Arc<SessionContext>,
        memory: Arc<MemoryStore>,
        perf: Arc<PerfTracker>,
        session_log: Arc<SessionLog>,
        config: AgentConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            stt,
            narration,
            dispatcher,
            bridge,
            executor,
            pipeline,
            client,
            screen,
            context,
            memory,
            perf,
            session_log,
            config,
            shutdown,
            current: None,
        }
    }

    /// Token that ends the loop from outside (Ctrl+C).
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Drive the voice loop until a quit token or external shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error only if the microphone session cannot start at all.
    pub async fn run(&mut self) -> Result<()> {
        self.narration.enqueue("Ready.");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.wait_for_done().await;
            if self.shutdown.is_cancelled() {
                break;
            }

            let (raw, pre_shot) = self.listen_once().await?;
            let Some(raw) = raw else { continue };
            let cleaned = fix_email_spacing(raw.trim());
            if cleaned.is_empty() {
                continue;
            }
            let id = NEXT_UTTERANCE_ID.fetch_add(1, Ordering::SeqCst) + 1;
            self.session_log.log(&format!("utterance {id}: \"{cleaned}\""));

            match cleaned.to_lowercase().as_str() {
                "quit" | "goodbye" | "exit" => {
                    info!("shutdown token heard");
                    self.dispatcher.cancel();
                    self.cancel_current(false);
                    if let Some(summary) = self.perf.summary() {
                        self.session_log.log(&format!(
                            "voice-to-first-action over {} utterance(s): median {}ms, max {}ms",
                            summary.count,
                            summary.median.as_millis(),
                            summary.max.as_millis(),
                        ));
                    }
                    self.narration.enqueue("Goodbye.");
                    self.narration.drain(SUMMARY_DRAIN).await;
                    self.shutdown.cancel();
                    break;
                }
                "stop" | "cancel" | "never mind" => {
                    // No orphan speculation may stay in flight.
                    self.dispatcher.cancel();
                    self.cancel_current(true);
                    continue;
                }
                _ => {}
            }

            if self.bridge.is_pending() {
                info!("routing transcript to clarification bridge");
                // An answer never claims a speculative result.
                self.dispatcher.cancel();
                self.bridge.provide_answer(&cleaned);
                continue;
            }

            // A new utterance supersedes the previous task.
            self.cancel_current(false);
            self.context.add_user(&cleaned);
            self.handle_utterance(id, cleaned, pre_shot).await;
        }
        Ok(())
    }

    /// Mute narration, settle, and run one listen with the speculative
    /// stable-partial callback attached.
    async fn listen_once(&mut self) -> Result<(Option<String>, Option<Screenshot>)> {
        self.narration.mute();
        sleep(MUTE_SETTLE).await;

        let pre_shot: Arc<Mutex<Option<Screenshot>>> = Arc::new(Mutex::new(None));
        let callback = self.stable_partial_callback(Arc::clone(&pre_shot));
        let shutdown = self.shutdown.clone();

        let result = tokio::select! {
            () = shutdown.cancelled() => None,
            result = self.stt.listen(callback) => Some(result),
        };
        self.narration.unmute();

        let Some(result) = result else {
            // External shutdown while listening.
            self.stt.stop_listening();
            return Ok((None, None));
        };
        let final_text = match result {
            Ok(text) => text,
            Err(e) => {
                warn!("listen failed: {e}");
                self.narration.enqueue("I couldn't hear you.");
                None
            }
        };
        let shot = pre_shot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        Ok((final_text, shot))
    }

    /// Pre-capture the screen and fire the speculative call when the
    /// stabilized partial looks like a simple command.
    fn stable_partial_callback(&self, pre_shot: Arc<Mutex<Option<Screenshot>>>) -> StablePartialFn {
        let screen = Arc::clone(&self.screen);
        let dispatcher = Arc::clone(&self.dispatcher);
        let executor = Arc::clone(&self.executor);
        let client = Arc::clone(&self.client);
        // The id this utterance will consume if the transcript lands.
        let id = NEXT_UTTERANCE_ID.load(Ordering::SeqCst) + 1;

        Box::new(move |partial: &str| {
            let mut slot = pre_shot
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if slot.is_none() {
                match screen.capture() {
                    Ok(shot) => *slot = Some(shot),
                    Err(e) => {
                        warn!("pre-capture failed: {e}");
                        return;
                    }
                }
            }
            let Some(shot) = slot.as_ref() else { return };

            if dispatcher.enabled() && is_simple_command(partial) {
                let request = executor.initial_request(partial, shot);
                let client = Arc::clone(&client);
                dispatcher.fire(id, partial, async move { client.complete(&request).await });
            }
        })
    }

    async fn handle_utterance(&mut self, id: u64, text: String, pre_shot: Option<Screenshot>) {
        let perf = Arc::new(PerfGuard::new(Arc::clone(&self.perf)));

        if is_simple_command(&text) {
            self.run_simple(id, text, pre_shot, perf).await;
            return;
        }

        self.dispatcher.cancel();
        let interpretation = interpret_voice_input(
            &self.client,
            &self.config.inference.planner_model,
            self.config.inference.max_tokens,
            &text,
            &self.context.transcript(),
            &self.memory.facts(),
        )
        .await;

        match interpretation {
            Ok(Interpretation::Command { directive, response })
            | Ok(Interpretation::Followup { directive, response }) => {
                if !response.is_empty() {
                    self.narration.enqueue(&response);
                    self.context.add_agent(&response);
                }
                let directive = if directive.is_empty() { text } else { directive };
                self.spawn_action_task(directive, pre_shot, None, perf);
            }
            Ok(Interpretation::Interrupt { response }) => {
                self.narration
                    .enqueue(if response.is_empty() { "Okay." } else { response.as_str() });
                perf.emit_no_action();
            }
            Ok(Interpretation::Chat { response }) => {
                self.narration.enqueue(&response);
                self.context.add_agent(&response);
                perf.emit_no_action();
            }
            Ok(Interpretation::Memory { remember, response }) => {
                match self.memory.add(&remember) {
                    Ok(_) => self
                        .narration
                        .enqueue(if response.is_empty() { "Got it." } else { response.as_str() }),
                    Err(e) => {
                        warn!("memory add failed: {e}");
                        self.narration.enqueue("I couldn't save that.");
                    }
                }
                perf.emit_no_action();
            }
            Err(e) => {
                // Interpreter unavailable: the simple path still works.
                warn!("interpreter failed ({e}), falling back to simple path");
                self.run_simple(id, text, pre_shot, perf).await;
            }
        }
    }

    /// The fast path: filler, speculative claim, direct loop.
    async fn run_simple(
        &mut self,
        id: u64,
        text: String,
        pre_shot: Option<Screenshot>,
        perf: Arc<PerfGuard>,
    ) {
        let filler = FILLERS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or("On it.");
        self.narration.enqueue(filler);

        let claimed = self.dispatcher.claim(id, &text).await;
        match claimed {
            Some(turn) if !turn.tool_calls.is_empty() => {
                if let Some(narration) = speakable_narration(&turn.text) {
                    self.narration.interrupt_and_enqueue(&narration);
                }
                self.spawn_action_task(text, pre_shot, Some(turn), perf);
            }
            Some(_) => {
                // Claimed but actionless: the partial was too ambiguous.
                info!("speculative result had no tool calls, running full loop");
                self.spawn_action_task(text, pre_shot, None, perf);
            }
            None => {
                self.dispatcher.cancel();
                self.spawn_action_task(text, pre_shot, None, perf);
            }
        }
    }

    /// Launch the action task that owns this utterance's execution.
    fn spawn_action_task(
        &mut self,
        directive: String,
        pre_shot: Option<Screenshot>,
        claimed: Option<crate::inference::stream::ModelTurn>,
        perf: Arc<PerfGuard>,
    ) {
        let cancel = CancellationToken::new();
        let done = TaskCompletionBox::new();
        let task = ActionTask { cancel: cancel.clone(), done: done.clone() };

        let executor = Arc::clone(&self.executor);
        let pipeline = Arc::clone(&self.pipeline);
        let narration = Arc::clone(&self.narration);
        let bridge = Arc::clone(&self.bridge);
        let screen = Arc::clone(&self.screen);
        let context = Arc::clone(&self.context);
        let session_log = Arc::clone(&self.session_log);
        let max_iterations = self.config.executor.max_direct_iterations;

        tokio::spawn(async move {
            let shot = match pre_shot.map(Ok).unwrap_or_else(|| screen.capture()) {
                Ok(shot) => shot,
                Err(e) => {
                    warn!("screen capture lost: {e}");
                    narration.enqueue("Lost screen access.");
                    done.complete("Lost screen access.");
                    perf.emit_no_action();
                    return;
                }
            };

            let mut outcome = match claimed {
                Some(turn) => {
                    executor
                        .run_claimed(turn, &directive, shot, &cancel, Some(&*perf))
                        .await
                }
                None => {
                    executor
                        .run_direct(&directive, shot, max_iterations, &cancel, Some(&*perf))
                        .await
                }
            };

            // First-level clarification: ask over the bridge and retry.
            if let DirectOutcome::Clarify(question) = outcome {
                outcome = ask_and_retry(
                    &executor, &narration, &bridge, &*screen, &directive, &question, &cancel,
                    max_iterations, &perf,
                )
                .await;
            }

            let summary = match outcome {
                DirectOutcome::Done(summary) => summary,
                DirectOutcome::Cancelled => "Cancelled.".to_owned(),
                DirectOutcome::Clarify(_) | DirectOutcome::Escalate => {
                    // Second-level clarify bypasses the bridge: the planner
                    // gets the request instead.
                    match screen.capture() {
                        Ok(shot) => pipeline.run(&directive, shot, &cancel, true).await,
                        Err(e) => {
                            warn!("screen capture lost: {e}");
                            "Lost screen access.".to_owned()
                        }
                    }
                }
            };

            if !cancel.is_cancelled() {
                let spoken = if summary.is_empty() { "Done." } else { summary.as_str() };
                narration.enqueue(spoken);
                context.add_agent(spoken);
                session_log.log(&format!("task finished: {spoken}"));
            }
            perf.emit_no_action();
            done.complete(&summary);
        });

        self.current = Some(task);
    }

    /// Poll the completion box without opening the microphone. Returns
    /// early when the bridge needs an answer collected; holds briefly
    /// after completion so the summary finishes speaking.
    async fn wait_for_done(&mut self) {
        let Some(task) = &self.current else { return };
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            if task.done.is_complete() {
                break;
            }
            if self.bridge.is_pending() {
                // The question is enqueued right after the pending flag is
                // set; one tick guarantees it lands before the drain.
                sleep(DONE_POLL).await;
                // Let the question finish speaking, then go collect the
                // answer via the next listen.
                self.narration.drain(SUMMARY_DRAIN).await;
                return;
            }
            sleep(DONE_POLL).await;
        }
        self.narration.drain(SUMMARY_DRAIN).await;
        self.current = None;
    }

    /// Cancel the in-flight task. When `announce` is set, the cancellation
    /// is spoken; a superseding utterance stays silent. The speculative
    /// slot is left alone: it may belong to the utterance being routed.
    fn cancel_current(&mut self, announce: bool) {
        if let Some(task) = self.current.take() {
            task.cancel();
            self.narration.interrupt();
            self.bridge.cancel();
            if announce {
                self.narration.enqueue("Cancelled.");
            }
            self.session_log.log("task cancelled");
        } else if announce {
            self.narration.enqueue("Nothing to cancel.");
        }
    }
}

/// Speak a clarification question over the bridge, wait for the answer,
/// and rerun the direct loop with the answer folded in.
#[allow(clippy::too_many_arguments)]
async fn ask_and_retry(
    executor: &Executor,
    narration: &NarrationQueue,
    bridge: &ClarificationBridge,
    screen: &dyn ScreenSource,
    directive: &str,
    question: &str,
    cancel: &CancellationToken,
    max_iterations: usize,
    perf: &PerfGuard,
) -> DirectOutcome {
    bridge.mark_pending();
    narration.enqueue(question);
    let answer = tokio::select! {
        () = cancel.cancelled() => None,
        answer = bridge.wait_for_answer() => answer,
    };
    let Some(answer) = answer else {
        return DirectOutcome::Cancelled;
    };

    let followup =
        format!("{directive}\n(You asked: \"{question}\" and the user answered: \"{answer}\")");
    match screen.capture() {
        Ok(shot) => {
            executor
                .run_direct(&followup, shot, max_iterations, cancel, Some(perf))
                .await
        }
        Err(e) => {
            warn!("screen capture lost: {e}");
            DirectOutcome::Done("Lost screen access.".to_owned())
        }
    }
}
