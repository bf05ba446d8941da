//! Planner pipeline: break a hard request into work blocks, execute them
//! through the fast executor, check outcomes, and replan on failure.
//!
//! The planner model speaks JSON only. Its output is parsed tolerantly:
//! markdown fences are stripped and the outermost `{...}` object is
//! extracted from any surrounding prose before deserializing.

use crate::clarify::ClarificationBridge;
use crate::config::{ExecutorConfig, InferenceConfig, PlannerConfig};
use crate::error::{AgentError, Result};
use crate::executor::{DirectOutcome, Executor};
use crate::inference::messages::Message;
use crate::inference::{ChatRequest, InferenceClient};
use crate::narration::NarrationQueue;
use crate::screen::{Screenshot, ScreenSource};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const PLAN_SYSTEM_PROMPT: &str = "\
You are a planner for a computer-use agent. Given a user request and a \
screenshot of the current screen, break the request into 1-4 work blocks. \
Each block is a directive of one to three imperative sentences addressed \
to an executor that controls mouse and keyboard, plus an expected_outcome: \
a visual assertion checkable against a screenshot.

If the request cannot be completed without more information from the \
user, add up to 2 short clarification questions; the final block(s) must \
then be the ones that depend on the answers.

Respond with JSON only:
{\"blocks\": [{\"directive\": \"...\", \"expected_outcome\": \"...\"}], \
\"clarifications\": [\"...\"]}";

const EVALUATE_SYSTEM_PROMPT: &str = "\
You judge whether a work block succeeded. Compare the expected outcome \
against the screenshot. Respond with JSON only: \
{\"status\": \"ok\" | \"failed\", \"summary\": \"one sentence\"}";

const REPLAN_SYSTEM_PROMPT: &str = "\
You are a planner for a computer-use agent. A previous plan stalled. \
Given the original request, what has been accomplished, and the current \
screen, produce a fresh plan of 1-3 work blocks. Respond with JSON only: \
{\"blocks\": [{\"directive\": \"...\", \"expected_outcome\": \"...\"}]}";

/// A planner-issued unit of work. Immutable once planned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkBlock {
    /// One to three imperative sentences addressed to the executor.
    pub directive: String,
    /// Visual assertion the planner checks against a screenshot.
    pub expected_outcome: String,
}

/// The planner's reply to an initial request.
#[derive(Debug, Clone, Default)]
pub struct PipelineResponse {
    pub blocks: Vec<WorkBlock>,
    /// When non-empty, the final block depends on the answers and must not
    /// execute until a clarification is resolved.
    pub clarifications: Vec<String>,
}

/// Outcome of a block evaluation.
#[derive(Debug, Clone)]
pub struct BlockVerdict {
    pub ok: bool,
    pub summary: String,
}

#[derive(Deserialize)]
struct WireBlock {
    directive: String,
    #[serde(default)]
    expected_outcome: String,
}

#[derive(Deserialize)]
struct WirePlan {
    #[serde(default)]
    blocks: Vec<WireBlock>,
    #[serde(default)]
    clarifications: Vec<String>,
}

#[derive(Deserialize)]
struct WireVerdict {
    status: String,
    #[serde(default)]
    summary: String,
}

/// JSON-only planner model calls.
pub struct Planner {
    client: Arc<InferenceClient>,
    inference: InferenceConfig,
}

impl Planner {
    #[must_use]
    pub fn new(client: Arc<InferenceClient>, inference: InferenceConfig) -> Self {
        Self { client, inference }
    }

    async fn call(&self, system: &str, user_text: &str, shot: &Screenshot) -> Result<String> {
        let request = ChatRequest {
            model: self.inference.planner_model.clone(),
            system: system.to_owned(),
            max_tokens: self.inference.max_tokens,
            messages: vec![Message::user_with_screenshot(user_text, shot)],
            tools: None,
        };
        let turn = self.client.complete(&request).await?;
        Ok(turn.text)
    }

    /// Plan 1-4 work blocks plus up to 2 clarification questions.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or unparseable output; the
    /// caller substitutes the fallback one-block plan.
    pub async fn plan_pipeline(
        &self,
        request: &str,
        shot: &Screenshot,
    ) -> Result<PipelineResponse> {
        let text = self.call(PLAN_SYSTEM_PROMPT, request, shot).await?;
        let plan: WirePlan = parse_json_response(&text)?;
        Ok(to_response(plan))
    }

    /// Ask the planner whether a block's expected outcome holds.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or unparseable output.
    pub async fn evaluate_block(
        &self,
        expected_outcome: &str,
        shot: &Screenshot,
        iterations: usize,
        hit_iteration_limit: bool,
        block_index: usize,
        total_blocks: usize,
    ) -> Result<BlockVerdict> {
        let prompt = format!(
            "Block {} of {total_blocks}. Expected outcome: {expected_outcome}\n\
             The executor ran {iterations} iteration(s){}.",
            block_index + 1,
            if hit_iteration_limit { " and hit its iteration limit" } else { "" },
        );
        let text = self.call(EVALUATE_SYSTEM_PROMPT, &prompt, shot).await?;
        let verdict: WireVerdict = parse_json_response(&text)?;
        Ok(BlockVerdict {
            ok: verdict.status.eq_ignore_ascii_case("ok"),
            summary: verdict.summary,
        })
    }

    /// Fresh 1-3 blocks after a failed block.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or unparseable output.
    pub async fn replan(
        &self,
        request: &str,
        accomplished: &[String],
        shot: &Screenshot,
    ) -> Result<PipelineResponse> {
        let prompt = format!(
            "Original request: {request}\nAccomplished so far: {}",
            join_or_none(accomplished),
        );
        let text = self.call(REPLAN_SYSTEM_PROMPT, &prompt, shot).await?;
        let plan: WirePlan = parse_json_response(&text)?;
        Ok(to_response(plan))
    }

    /// Fresh blocks incorporating the user's clarification answer.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or unparseable output.
    pub async fn replan_with_clarification(
        &self,
        request: &str,
        answer: &str,
        accomplished: &[String],
        shot: &Screenshot,
    ) -> Result<PipelineResponse> {
        let prompt = format!(
            "Original request: {request}\nThe user clarified: {answer}\n\
             Accomplished so far: {}",
            join_or_none(accomplished),
        );
        let text = self.call(REPLAN_SYSTEM_PROMPT, &prompt, shot).await?;
        let plan: WirePlan = parse_json_response(&text)?;
        Ok(to_response(plan))
    }
}

fn to_response(plan: WirePlan) -> PipelineResponse {
    PipelineResponse {
        blocks: plan
            .blocks
            .into_iter()
            .map(|b| WorkBlock {
                directive: b.directive,
                expected_outcome: b.expected_outcome,
            })
            .collect(),
        clarifications: plan.clarifications,
    }
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "nothing yet".to_owned()
    } else {
        items.join("; ")
    }
}

/// Verbatim user text as a single block, used when the planner itself is
/// unreachable.
fn fallback_plan(request: &str) -> PipelineResponse {
    PipelineResponse {
        blocks: vec![WorkBlock {
            directive: request.to_owned(),
            expected_outcome: "The request appears complete on screen.".to_owned(),
        }],
        clarifications: Vec::new(),
    }
}

// ── tolerant JSON parsing ────────────────────────────────────────────

/// Parse a model reply, tolerating markdown fences and surrounding prose.
pub(crate) fn parse_json_response<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
    let unfenced = strip_markdown_fences(text);
    let body = extract_json_object(&unfenced).unwrap_or(unfenced.trim());
    serde_json::from_str(body).map_err(|e| {
        warn!("unparseable planner output: {text}");
        AgentError::Parse(format!("planner JSON: {e}"))
    })
}

fn strip_markdown_fences(text: &str) -> String {
    let mut s = text.to_owned();
    if let Some(start) = s.find("```") {
        let fence_end = s[start + 3..]
            .find('\n')
            .map(|i| start + 3 + i + 1)
            .unwrap_or(start + 3);
        s.replace_range(start..fence_end, "");
    }
    if let Some(end) = s.rfind("```") {
        s.replace_range(end..end + 3, "");
    }
    s
}

/// Extract the outermost `{...}` object, accounting for nested braces and
/// quoted strings.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

// ── pipeline execution ───────────────────────────────────────────────

/// Escalation path: plan, execute blocks, evaluate, replan; clarifications
/// are asked in parallel over the narration queue and folded back in via
/// a replan once answered.
pub struct PlannerPipeline {
    planner: Arc<Planner>,
    executor: Arc<Executor>,
    screen: Arc<dyn ScreenSource>,
    narration: Arc<NarrationQueue>,
    bridge: Arc<ClarificationBridge>,
    executor_config: ExecutorConfig,
    config: PlannerConfig,
}

impl PlannerPipeline {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        planner: Arc<Planner>,
        executor: Arc<Executor>,
        screen: Arc<dyn ScreenSource>,
        narration: Arc<NarrationQueue>,
        bridge: Arc<ClarificationBridge>,
        executor_config: ExecutorConfig,
        config: PlannerConfig,
    ) -> Self {
        Self {
            planner,
            executor,
            screen,
            narration,
            bridge,
            executor_config,
            config,
        }
    }

    /// Run the full escalation path and return the spoken summary.
    ///
    /// `use_bridge` is false outside the voice loop; clarifications are
    /// then skipped and only the executable prefix runs.
    pub async fn run(
        &self,
        request: &str,
        initial_shot: Screenshot,
        cancel: &CancellationToken,
        use_bridge: bool,
    ) -> String {
        let plan = match self.planner.plan_pipeline(request, &initial_shot).await {
            Ok(plan) if !plan.blocks.is_empty() => plan,
            Ok(_) => fallback_plan(request),
            Err(e) => {
                warn!("planner unavailable ({e}), using fallback plan");
                fallback_plan(request)
            }
        };
        info!(
            "plan: {} block(s), {} clarification(s)",
            plan.blocks.len(),
            plan.clarifications.len()
        );

        let mut blocks = plan.blocks.clone();
        let ask_task = if plan.clarifications.is_empty() {
            None
        } else {
            // The final block depends on the answers; hold it back.
            blocks.pop();
            if use_bridge {
                Some(self.spawn_ask_loop(plan.clarifications.clone(), cancel.clone()))
            } else {
                info!("no voice loop; skipping clarification questions");
                None
            }
        };

        let mut accomplished: Vec<String> = Vec::new();
        if let Err(Interrupted) = self
            .execute_blocks(request, &mut blocks, &mut accomplished, cancel)
            .await
        {
            self.bridge.cancel();
            return "Cancelled.".to_owned();
        }

        if let Some(handle) = ask_task {
            match handle.await {
                Ok(Some(answer)) => {
                    if let Err(Interrupted) = self
                        .run_clarified_blocks(request, &answer, &mut accomplished, cancel)
                        .await
                    {
                        return "Cancelled.".to_owned();
                    }
                }
                _ => {
                    info!("clarification never answered; returning partial result");
                }
            }
        }

        if accomplished.is_empty() {
            "I couldn't complete that.".to_owned()
        } else {
            accomplished.join(" ")
        }
    }

    /// Ask each clarification over the bridge, in order. Answers join into
    /// one reply for the replan.
    fn spawn_ask_loop(
        &self,
        questions: Vec<String>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<Option<String>> {
        let narration = Arc::clone(&self.narration);
        let bridge = Arc::clone(&self.bridge);
        tokio::spawn(async move {
            let mut answers = Vec::new();
            for question in questions {
                if cancel.is_cancelled() {
                    return None;
                }
                bridge.mark_pending();
                narration.enqueue(&question);
                match bridge.wait_for_answer().await {
                    Some(answer) => answers.push(answer),
                    None => return None,
                }
            }
            if answers.is_empty() {
                None
            } else {
                Some(answers.join("; "))
            }
        })
    }

    async fn run_clarified_blocks(
        &self,
        request: &str,
        answer: &str,
        accomplished: &mut Vec<String>,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Interrupted> {
        let Ok(shot) = self.screen.capture() else {
            accomplished.push("Lost screen access.".to_owned());
            return Ok(());
        };
        let plan = match self
            .planner
            .replan_with_clarification(request, answer, accomplished, &shot)
            .await
        {
            Ok(plan) if !plan.blocks.is_empty() => plan,
            _ => {
                warn!("replan with clarification failed");
                return Ok(());
            }
        };
        let mut blocks = plan.blocks;
        self.execute_blocks(request, &mut blocks, accomplished, cancel)
            .await
    }

    /// Execute blocks sequentially, evaluating each and replanning on
    /// failure. Replans are capped; beyond the cap the partial
    /// accomplishment is returned.
    async fn execute_blocks(
        &self,
        request: &str,
        blocks: &mut Vec<WorkBlock>,
        accomplished: &mut Vec<String>,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Interrupted> {
        let mut replans = 0usize;
        let mut index = 0usize;

        while index < blocks.len() {
            if cancel.is_cancelled() {
                return Err(Interrupted);
            }
            let block = blocks[index].clone();
            let Ok(shot) = self.screen.capture() else {
                accomplished.push("Lost screen access.".to_owned());
                return Ok(());
            };

            info!("executing block {}/{}: {}", index + 1, blocks.len(), block.directive);
            let outcome = self
                .executor
                .run_direct(
                    &block.directive,
                    shot,
                    self.executor_config.max_iterations_per_block,
                    cancel,
                    None,
                )
                .await;

            let hit_limit = matches!(outcome, DirectOutcome::Escalate);
            match outcome {
                DirectOutcome::Cancelled => return Err(Interrupted),
                DirectOutcome::Done(_) | DirectOutcome::Escalate | DirectOutcome::Clarify(_) => {}
            }

            let Ok(after) = self.screen.capture() else {
                accomplished.push("Lost screen access.".to_owned());
                return Ok(());
            };
            let verdict = match self
                .planner
                .evaluate_block(
                    &block.expected_outcome,
                    &after,
                    self.executor_config.max_iterations_per_block,
                    hit_limit,
                    index,
                    blocks.len(),
                )
                .await
            {
                Ok(verdict) => verdict,
                Err(e) => {
                    // Evaluation unavailable: advance rather than spin.
                    warn!("block evaluation failed ({e}), assuming ok");
                    BlockVerdict { ok: true, summary: block.directive.clone() }
                }
            };

            if verdict.ok {
                accomplished.push(if verdict.summary.is_empty() {
                    block.directive.clone()
                } else {
                    verdict.summary
                });
                index += 1;
                continue;
            }

            if replans >= self.config.max_replans {
                info!("replan budget exhausted, returning partial result");
                return Ok(());
            }
            replans += 1;
            let Ok(shot) = self.screen.capture() else {
                accomplished.push("Lost screen access.".to_owned());
                return Ok(());
            };
            match self.planner.replan(request, accomplished, &shot).await {
                Ok(plan) if !plan.blocks.is_empty() => {
                    info!("replanned: {} fresh block(s)", plan.blocks.len());
                    *blocks = plan.blocks;
                    index = 0;
                }
                _ => {
                    warn!("replan failed, returning partial result");
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

/// The user interrupted; unwinds the pipeline without a summary.
struct Interrupted;
