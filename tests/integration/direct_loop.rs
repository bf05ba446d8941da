//! End-to-end direct-execution loop against the canned inference server.

use crate::helpers::{FakeScreen, FakeSink, InstantTts, SseServer, sse_response, sse_text, test_config};
use cua::action::ScreenAction;
use cua::inference::InferenceClient;
use cua::narration::NarrationQueue;
use cua::screen::ScreenSource;
use cua::{DirectOutcome, Executor};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn build_executor(
    server: &SseServer,
    screen: &Arc<FakeScreen>,
    sink: &Arc<FakeSink>,
    tts: &Arc<InstantTts>,
) -> Executor {
    let config = test_config(&server.url);
    let client = Arc::new(InferenceClient::new(&config.inference));
    let narration = Arc::new(NarrationQueue::new(
        Arc::clone(tts) as Arc<dyn cua::narration::TtsBackend>
    ));
    Executor::new(
        client,
        Arc::clone(screen) as Arc<dyn cua::screen::ScreenSource>,
        Arc::clone(sink) as Arc<dyn cua::action::ActionSink>,
        narration,
        config.executor.clone(),
        config.inference.clone(),
    )
}

#[tokio::test]
async fn open_chrome_runs_batch_then_done() {
    let server = SseServer::start(vec![
        sse_response(
            "Opening Chrome. One moment.",
            &[
                json!({"action": "key", "key": "cmd+space"}),
                json!({"action": "type", "text": "Chrome"}),
                json!({"action": "key", "key": "Return"}),
            ],
            "tool_use",
        ),
        sse_text("DONE: Opening Chrome"),
    ]);
    let screen = FakeScreen::new();
    let sink = FakeSink::new();
    let tts = InstantTts::new();
    let executor = build_executor(&server, &screen, &sink, &tts);

    let shot = screen.capture().unwrap();
    let outcome = executor
        .run_direct("Open Chrome", shot, 8, &CancellationToken::new(), None)
        .await;

    assert_eq!(outcome, DirectOutcome::Done("Opening Chrome".to_owned()));
    let actions = sink.recorded();
    assert_eq!(
        actions,
        vec![
            ScreenAction::Key { chord: "cmd+space".into() },
            ScreenAction::Type { text: "Chrome".into() },
            ScreenAction::Key { chord: "Return".into() },
        ]
    );
    // The first streamed sentence was narrated before the batch finished.
    assert!(tts.spoken().iter().any(|s| s.contains("Opening Chrome")));
    // First successful batch maximized the foreground window, once.
    assert_eq!(sink.maximize_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn tool_results_pair_one_to_one_with_tool_use_ids() {
    let server = SseServer::start(vec![
        sse_response(
            "",
            &[
                json!({"action": "left_click", "coordinate": [10, 10]}),
                json!({"action": "type", "text": "hello"}),
            ],
            "tool_use",
        ),
        sse_text("DONE: Typed it"),
    ]);
    let screen = FakeScreen::new();
    let sink = FakeSink::new();
    let tts = InstantTts::new();
    let executor = build_executor(&server, &screen, &sink, &tts);

    let shot = screen.capture().unwrap();
    let outcome = executor
        .run_direct("click and type", shot, 8, &CancellationToken::new(), None)
        .await;
    assert_eq!(outcome, DirectOutcome::Done("Typed it".to_owned()));

    // The second request carries the tool results for both ids, in input
    // order, with exactly one screenshot (on the last result).
    let body: serde_json::Value = serde_json::from_str(&server.request(1)).unwrap();
    let results = body["messages"][2]["content"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["type"], "tool_result");
    assert_eq!(results[0]["tool_use_id"], "tu_0");
    assert_eq!(results[1]["tool_use_id"], "tu_1");
    let images_in_first = count_images(&results[0]["content"]);
    let images_in_last = count_images(&results[1]["content"]);
    assert_eq!(images_in_first, 0);
    assert_eq!(images_in_last, 1);
}

fn count_images(content: &serde_json::Value) -> usize {
    content
        .as_array()
        .map(|items| items.iter().filter(|i| i["type"] == "image").count())
        .unwrap_or(0)
}

#[tokio::test]
async fn model_coordinates_rescale_to_logical_screen() {
    let server = SseServer::start(vec![
        sse_response(
            "",
            &[json!({"action": "left_click", "coordinate": [512, 320]})],
            "tool_use",
        ),
        sse_text("DONE: Clicked"),
    ]);
    let screen = FakeScreen::new();
    let sink = FakeSink::new();
    let tts = InstantTts::new();
    let executor = build_executor(&server, &screen, &sink, &tts);

    let shot = screen.capture().unwrap();
    executor
        .run_direct("click the middle", shot, 8, &CancellationToken::new(), None)
        .await;

    // Fake screen is 2048x1280 logical over a 1024x640 bitmap: 2x scale.
    assert_eq!(sink.recorded(), vec![ScreenAction::LeftClick { x: 1024, y: 640 }]);
}

#[tokio::test]
async fn clarify_signal_terminates_loop() {
    let server = SseServer::start(vec![sse_text("CLARIFY: Which browser do you mean?")]);
    let screen = FakeScreen::new();
    let sink = FakeSink::new();
    let tts = InstantTts::new();
    let executor = build_executor(&server, &screen, &sink, &tts);

    let shot = screen.capture().unwrap();
    let outcome = executor
        .run_direct("open it", shot, 8, &CancellationToken::new(), None)
        .await;
    assert_eq!(
        outcome,
        DirectOutcome::Clarify("Which browser do you mean?".to_owned())
    );
    assert!(sink.recorded().is_empty());
}

#[tokio::test]
async fn plain_question_treated_as_clarify() {
    let server = SseServer::start(vec![sse_text("Did you want Chrome or Safari?")]);
    let screen = FakeScreen::new();
    let sink = FakeSink::new();
    let tts = InstantTts::new();
    let executor = build_executor(&server, &screen, &sink, &tts);

    let shot = screen.capture().unwrap();
    let outcome = executor
        .run_direct("open the browser", shot, 8, &CancellationToken::new(), None)
        .await;
    assert!(matches!(outcome, DirectOutcome::Clarify(q) if q.contains('?')));
}

#[tokio::test]
async fn http_failure_escalates() {
    let server = SseServer::start(vec![]);
    let screen = FakeScreen::new();
    let sink = FakeSink::new();
    let tts = InstantTts::new();
    let executor = build_executor(&server, &screen, &sink, &tts);

    let shot = screen.capture().unwrap();
    let outcome = executor
        .run_direct("open chrome", shot, 8, &CancellationToken::new(), None)
        .await;
    assert_eq!(outcome, DirectOutcome::Escalate);
}

#[tokio::test]
async fn guide_signal_skips_tools_and_recaptures() {
    let server = SseServer::start(vec![
        sse_response(
            "GUIDE: (100, 50) Click the blue Submit button",
            &[json!({"action": "left_click", "coordinate": [1, 1]})],
            "tool_use",
        ),
        sse_text("DONE: Guided"),
    ]);
    let screen = FakeScreen::new();
    let sink = FakeSink::new();
    let tts = InstantTts::new();
    let executor = build_executor(&server, &screen, &sink, &tts);

    let shot = screen.capture().unwrap();
    let outcome = executor
        .run_direct("submit the form", shot, 8, &CancellationToken::new(), None)
        .await;

    assert_eq!(outcome, DirectOutcome::Done("Guided".to_owned()));
    // A GUIDE response never executes its tool calls.
    assert!(sink.recorded().is_empty());
    // The guidance instruction was narrated.
    assert!(tts.spoken().iter().any(|s| s.contains("Submit button")));
    // The follow-up request tells the model the user was guided.
    assert!(server.request(1).contains("The user was guided"));
}

#[tokio::test]
async fn iteration_cap_escalates() {
    // Every round returns another tool call; the loop must give up.
    let click = sse_response(
        "",
        &[json!({"action": "left_click", "coordinate": [5, 5]})],
        "tool_use",
    );
    let server = SseServer::start(vec![click.clone(), click.clone(), click]);
    let screen = FakeScreen::new();
    let sink = FakeSink::new();
    let tts = InstantTts::new();
    let executor = build_executor(&server, &screen, &sink, &tts);

    let shot = screen.capture().unwrap();
    let outcome = executor
        .run_direct("keep clicking", shot, 3, &CancellationToken::new(), None)
        .await;
    assert_eq!(outcome, DirectOutcome::Escalate);
    assert_eq!(sink.recorded().len(), 3);
}

#[tokio::test]
async fn repeat_clicks_inject_warning_into_last_tool_result() {
    let server = SseServer::start(vec![
        sse_response(
            "",
            &[
                json!({"action": "left_click", "coordinate": [100, 100]}),
                json!({"action": "left_click", "coordinate": [104, 98]}),
            ],
            "tool_use",
        ),
        sse_text("DONE: Stopped clicking"),
    ]);
    let screen = FakeScreen::new();
    let sink = FakeSink::new();
    let tts = InstantTts::new();
    let executor = build_executor(&server, &screen, &sink, &tts);

    let shot = screen.capture().unwrap();
    executor
        .run_direct("click the button", shot, 8, &CancellationToken::new(), None)
        .await;

    let body = server.request(1);
    assert!(body.contains("keyboard navigation"), "warning missing: {body}");
}

#[tokio::test]
async fn screen_loss_mid_task_returns_summary() {
    let server = SseServer::start(vec![sse_response(
        "",
        &[json!({"action": "left_click", "coordinate": [5, 5]})],
        "tool_use",
    )]);
    let screen = FakeScreen::new();
    let sink = FakeSink::new();
    let tts = InstantTts::new();
    let executor = build_executor(&server, &screen, &sink, &tts);

    let shot = screen.capture().unwrap();
    // Capture dies after the initial shot.
    screen.fail.store(true, std::sync::atomic::Ordering::SeqCst);
    let outcome = executor
        .run_direct("click it", shot, 8, &CancellationToken::new(), None)
        .await;
    assert_eq!(outcome, DirectOutcome::Done("Lost screen access.".to_owned()));
}
