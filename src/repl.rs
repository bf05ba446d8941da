//! Text REPL: the same executor/planner pipeline without a microphone.
//!
//! Typed requests run through the direct-execution loop and escalate to
//! the planner exactly like spoken ones; the clarification bridge is
//! bypassed, so clarifications escalate instead of suspending.

use crate::config::AgentConfig;
use crate::context::SessionContext;
use crate::error::Result;
use crate::executor::{DirectOutcome, Executor};
use crate::narration::{NarrationQueue, TtsBackend};
use crate::planner::PlannerPipeline;
use crate::screen::ScreenSource;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Narration backend that prints instead of speaking.
pub struct PrintTts;

impl TtsBackend for PrintTts {
    fn speak(&self, text: &str, on_done: Box<dyn FnOnce() + Send>) {
        println!("cua: {text}");
        on_done();
    }
    fn stop(&self) {}
}

pub struct TextRepl {
    executor: Arc<Executor>,
    pipeline: Arc<PlannerPipeline>,
    narration: Arc<NarrationQueue>,
    screen: Arc<dyn ScreenSource>,
    context: Arc<SessionContext>,
    config: AgentConfig,
    shutdown: CancellationToken,
}

impl TextRepl {
    #[must_use]
    pub fn new(
        executor: Arc<Executor>,
        pipeline: Arc<PlannerPipeline>,
        narration: Arc<NarrationQueue>,
        screen: Arc<dyn ScreenSource>,
        context: Arc<SessionContext>,
        config: AgentConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            executor,
            pipeline,
            narration,
            screen,
            context,
            config,
            shutdown,
        }
    }

    /// Read requests from stdin until EOF or a quit token.
    ///
    /// # Errors
    ///
    /// Returns an error if stdin cannot be read.
    pub async fn run(&self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            stdout.write_all(b"> ").await?;
            stdout.flush().await?;

            let line = tokio::select! {
                () = self.shutdown.cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else { break };
            let request = line.trim();
            if request.is_empty() {
                continue;
            }
            if matches!(request.to_lowercase().as_str(), "quit" | "exit" | "goodbye") {
                break;
            }

            self.context.add_user(request);
            let summary = self.run_request(request).await;
            self.context.add_agent(&summary);
        }
        Ok(())
    }

    async fn run_request(&self, request: &str) -> String {
        let shot = match self.screen.capture() {
            Ok(shot) => shot,
            Err(e) => {
                warn!("screen capture lost: {e}");
                self.narration.enqueue("Lost screen access.");
                return "Lost screen access.".to_owned();
            }
        };

        let outcome = self
            .executor
            .run_direct(
                request,
                shot,
                self.config.executor.max_direct_iterations,
                &self.shutdown.child_token(),
                None,
            )
            .await;

        let summary = match outcome {
            DirectOutcome::Done(summary) => summary,
            DirectOutcome::Cancelled => "Cancelled.".to_owned(),
            // No bridge outside the voice loop: clarifications escalate.
            DirectOutcome::Clarify(_) | DirectOutcome::Escalate => match self.screen.capture() {
                Ok(shot) => {
                    self.pipeline
                        .run(request, shot, &self.shutdown.child_token(), false)
                        .await
                }
                Err(e) => {
                    warn!("screen capture lost: {e}");
                    "Lost screen access.".to_owned()
                }
            },
        };

        let spoken = if summary.is_empty() { "Done." } else { summary.as_str() };
        self.narration.enqueue(spoken);
        self.narration
            .drain(std::time::Duration::from_secs(1))
            .await;
        spoken.to_owned()
    }
}
