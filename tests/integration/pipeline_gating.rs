//! Planner pipeline: block gating, clarification fan-out, replanning.

use crate::helpers::{FakeScreen, FakeSink, InstantTts, SseServer, sse_text, test_config};
use cua::clarify::ClarificationBridge;
use cua::inference::InferenceClient;
use cua::narration::NarrationQueue;
use cua::planner::{Planner, PlannerPipeline};
use cua::screen::ScreenSource;
use cua::Executor;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Rig {
    pipeline: PlannerPipeline,
    screen: Arc<FakeScreen>,
    tts: Arc<InstantTts>,
    bridge: Arc<ClarificationBridge>,
}

fn build(server: &SseServer) -> Rig {
    let config = test_config(&server.url);
    let client = Arc::new(InferenceClient::new(&config.inference));
    let screen = FakeScreen::new();
    let sink = FakeSink::new();
    let tts = InstantTts::new();
    let narration = Arc::new(NarrationQueue::new(
        Arc::clone(&tts) as Arc<dyn cua::narration::TtsBackend>
    ));
    let executor = Arc::new(Executor::new(
        Arc::clone(&client),
        Arc::clone(&screen) as Arc<dyn cua::screen::ScreenSource>,
        Arc::clone(&sink) as Arc<dyn cua::action::ActionSink>,
        Arc::clone(&narration),
        config.executor.clone(),
        config.inference.clone(),
    ));
    let planner = Arc::new(Planner::new(Arc::clone(&client), config.inference.clone()));
    let bridge = Arc::new(ClarificationBridge::new());
    let pipeline = PlannerPipeline::new(
        planner,
        executor,
        Arc::clone(&screen) as Arc<dyn cua::screen::ScreenSource>,
        narration,
        Arc::clone(&bridge),
        config.executor.clone(),
        config.planner.clone(),
    );
    Rig { pipeline, screen, tts, bridge }
}

fn two_block_plan_with_question() -> String {
    sse_text(
        &json!({
            "blocks": [
                { "directive": "Open the flight search page",
                  "expected_outcome": "Flight search page visible" },
                { "directive": "Enter the travel date",
                  "expected_outcome": "Date field filled" },
            ],
            "clarifications": ["When do you want to fly?"],
        })
        .to_string(),
    )
}

#[tokio::test]
async fn final_block_held_back_without_a_voice_loop() {
    let server = SseServer::start(vec![
        two_block_plan_with_question(),
        sse_text("DONE: Flight page open"),
        sse_text(r#"{"status":"ok","summary":"Flight search page is open."}"#),
    ]);
    let rig = build(&server);

    let shot = rig.screen.capture().unwrap();
    let summary = rig
        .pipeline
        .run("find flights to lisbon", shot, &CancellationToken::new(), false)
        .await;

    // Plan, one block, one evaluation: the date-entry block never ran.
    assert_eq!(server.request_count(), 3);
    assert!(summary.contains("Flight search page"));
}

#[tokio::test]
async fn clarification_answer_folds_into_a_replan() {
    let server = SseServer::start(vec![
        two_block_plan_with_question(),
        sse_text("DONE: Flight page open"),
        sse_text(r#"{"status":"ok","summary":"Flight search page is open."}"#),
        sse_text(
            &json!({
                "blocks": [{
                    "directive": "Search flights for next Friday",
                    "expected_outcome": "Results for next Friday shown",
                }],
            })
            .to_string(),
        ),
        sse_text("DONE: Searched"),
        sse_text(r#"{"status":"ok","summary":"Results for next Friday are shown."}"#),
    ]);
    let rig = build(&server);

    // Play the user: answer as soon as the question goes pending.
    let bridge = Arc::clone(&rig.bridge);
    tokio::spawn(async move {
        for _ in 0..200 {
            if bridge.is_pending() {
                bridge.provide_answer("next friday");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    let shot = rig.screen.capture().unwrap();
    let summary = rig
        .pipeline
        .run("find flights to lisbon", shot, &CancellationToken::new(), true)
        .await;

    assert_eq!(server.request_count(), 6);
    assert!(summary.contains("next Friday"), "got: {summary}");
    // The question was spoken over the narration queue.
    assert!(rig.tts.spoken().iter().any(|s| s.contains("When do you want to fly")));
}

#[tokio::test]
async fn failed_block_triggers_replan() {
    let server = SseServer::start(vec![
        sse_text(
            &json!({
                "blocks": [{
                    "directive": "Open the settings pane",
                    "expected_outcome": "Settings pane visible",
                }],
            })
            .to_string(),
        ),
        sse_text("DONE: Tried"),
        sse_text(r#"{"status":"failed","summary":"Wrong window is focused."}"#),
        sse_text(
            &json!({
                "blocks": [{
                    "directive": "Focus the app, then open the settings pane",
                    "expected_outcome": "Settings pane visible",
                }],
            })
            .to_string(),
        ),
        sse_text("DONE: Opened"),
        sse_text(r#"{"status":"ok","summary":"Settings pane is open."}"#),
    ]);
    let rig = build(&server);

    let shot = rig.screen.capture().unwrap();
    let summary = rig
        .pipeline
        .run("open settings", shot, &CancellationToken::new(), false)
        .await;

    assert_eq!(server.request_count(), 6);
    assert!(summary.contains("Settings pane is open"));
}

#[tokio::test]
async fn planner_outage_falls_back_to_verbatim_block() {
    // Plan request fails (500); the verbatim fallback block then runs
    // through the executor, which also fails, ending in an apology.
    let server = SseServer::start(vec![]);
    let rig = build(&server);

    let shot = rig.screen.capture().unwrap();
    let summary = rig
        .pipeline
        .run("open settings", shot, &CancellationToken::new(), false)
        .await;

    // Evaluation was also unreachable, so the block is assumed ok and its
    // directive becomes the accomplishment record.
    assert!(summary.contains("open settings"), "got: {summary}");
}
