//! Speculative dispatch against the canned inference server.

use crate::helpers::{FakeScreen, SseServer, sse_response, test_config};
use cua::config::SpeculationConfig;
use cua::inference::InferenceClient;
use cua::screen::ScreenSource;
use cua::speculative::SpeculativeDispatcher;
use cua::Executor;
use serde_json::json;
use std::sync::Arc;

fn spec_config() -> SpeculationConfig {
    SpeculationConfig {
        enabled: true,
        cooldown_ms: 0,
        min_processing_ms: 0,
        ..SpeculationConfig::default()
    }
}

fn fire_against(server: &SseServer, dispatcher: &SpeculativeDispatcher, id: u64, partial: &str) {
    let config = test_config(&server.url);
    let client = Arc::new(InferenceClient::new(&config.inference));
    let screen = FakeScreen::new();
    let sink = crate::helpers::FakeSink::new();
    let tts = crate::helpers::InstantTts::new();
    let narration = Arc::new(cua::narration::NarrationQueue::new(
        tts as Arc<dyn cua::narration::TtsBackend>,
    ));
    let executor = Executor::new(
        Arc::clone(&client),
        Arc::clone(&screen) as Arc<dyn cua::screen::ScreenSource>,
        sink as Arc<dyn cua::action::ActionSink>,
        narration,
        config.executor.clone(),
        config.inference.clone(),
    );
    let shot = screen.capture().unwrap();
    let request = executor.initial_request(partial, &shot);
    assert!(dispatcher.fire(id, partial, async move { client.complete(&request).await }));
}

#[tokio::test]
async fn stable_partial_fires_and_final_claims() {
    let server = SseServer::start(vec![sse_response(
        "NARRATE: Opening Chrome",
        &[json!({"action": "key", "key": "cmd+space"})],
        "tool_use",
    )]);
    let dispatcher = SpeculativeDispatcher::new(spec_config());

    fire_against(&server, &dispatcher, 1, "open chrome");
    let claimed = dispatcher.claim(1, "open chrome").await;

    let turn = claimed.expect("matching final should claim");
    assert_eq!(turn.tool_calls.len(), 1);
    assert!(turn.text.contains("Opening Chrome"));
}

#[tokio::test]
async fn diverging_final_discards_the_speculation() {
    let server = SseServer::start(vec![sse_response(
        "NARRATE: Opening Chrome",
        &[json!({"action": "key", "key": "cmd+space"})],
        "tool_use",
    )]);
    let dispatcher = SpeculativeDispatcher::new(spec_config());

    // Partial stabilized as "open chrome" but the user kept talking.
    fire_against(&server, &dispatcher, 1, "open chrome");
    let claimed = dispatcher.claim(1, "open the settings").await;
    assert!(claimed.is_none());
}

#[tokio::test]
async fn failed_call_resolves_to_cancelled() {
    // Server serves nothing: the speculative call gets HTTP 500.
    let server = SseServer::start(vec![]);
    let dispatcher = SpeculativeDispatcher::new(spec_config());

    fire_against(&server, &dispatcher, 1, "open chrome");
    let claimed = dispatcher.claim(1, "open chrome").await;
    assert!(claimed.is_none());
}
