//! Full voice-loop runs with a scripted microphone.

use crate::helpers::{FakeScreen, FakeSink, InstantTts, SseServer, sse_response, sse_text, test_config};
use async_trait::async_trait;
use cua::clarify::ClarificationBridge;
use cua::context::SessionContext;
use cua::inference::InferenceClient;
use cua::memory::MemoryStore;
use cua::narration::NarrationQueue;
use cua::perf::PerfTracker;
use cua::planner::{Planner, PlannerPipeline};
use cua::session_log::SessionLog;
use cua::speculative::SpeculativeDispatcher;
use cua::stt::{SttProvider, StablePartialFn};
use cua::{Executor, VoiceManager};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Microphone that replays a script of final transcripts, then asks for
/// shutdown.
struct ScriptedStt {
    script: Mutex<Vec<String>>,
    shutdown: CancellationToken,
}

#[async_trait]
impl SttProvider for ScriptedStt {
    async fn setup(&mut self) -> bool {
        true
    }

    async fn listen(&mut self, _on_stable_partial: StablePartialFn) -> cua::Result<Option<String>> {
        let next = self.script.lock().unwrap().pop();
        match next {
            Some(text) => Ok(Some(text)),
            None => {
                self.shutdown.cancel();
                Ok(None)
            }
        }
    }

    fn stop_listening(&self) {}
}

struct Rig {
    sink: Arc<FakeSink>,
    tts: Arc<InstantTts>,
    memory: Arc<MemoryStore>,
    manager: VoiceManager,
    _dir: tempfile::TempDir,
}

fn build(server: &SseServer, script: Vec<&str>) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server.url);
    let client = Arc::new(InferenceClient::new(&config.inference));
    let screen = FakeScreen::new();
    let sink = FakeSink::new();
    let tts = InstantTts::new();
    let narration = Arc::new(NarrationQueue::new(
        Arc::clone(&tts) as Arc<dyn cua::narration::TtsBackend>
    ));
    let dispatcher = Arc::new(SpeculativeDispatcher::new(config.speculation.clone()));
    let bridge = Arc::new(ClarificationBridge::new());
    let context = Arc::new(SessionContext::new());
    let memory = Arc::new(MemoryStore::open(&dir.path().join("memory.json")).unwrap());
    let perf = Arc::new(PerfTracker::new());
    let session_log = Arc::new(SessionLog::create(&dir.path().join("logs")).unwrap());

    let executor = Arc::new(Executor::new(
        Arc::clone(&client),
        Arc::clone(&screen) as Arc<dyn cua::screen::ScreenSource>,
        Arc::clone(&sink) as Arc<dyn cua::action::ActionSink>,
        Arc::clone(&narration),
        config.executor.clone(),
        config.inference.clone(),
    ));
    let planner = Arc::new(Planner::new(Arc::clone(&client), config.inference.clone()));
    let pipeline = Arc::new(PlannerPipeline::new(
        planner,
        Arc::clone(&executor),
        Arc::clone(&screen) as Arc<dyn cua::screen::ScreenSource>,
        Arc::clone(&narration),
        Arc::clone(&bridge),
        config.executor.clone(),
        config.planner.clone(),
    ));

    let shutdown = CancellationToken::new();
    // The script is popped back-to-front.
    let mut reversed: Vec<String> = script.into_iter().map(str::to_owned).collect();
    reversed.reverse();
    let stt = Box::new(ScriptedStt {
        script: Mutex::new(reversed),
        shutdown: shutdown.clone(),
    });

    let manager = VoiceManager::new(
        stt,
        narration,
        dispatcher,
        bridge,
        executor,
        pipeline,
        client,
        Arc::clone(&screen) as Arc<dyn cua::screen::ScreenSource>,
        context,
        Arc::clone(&memory),
        perf,
        session_log,
        config,
        shutdown,
    );

    Rig { sink, tts, memory, manager, _dir: dir }
}

#[tokio::test]
async fn spoken_command_executes_and_narrates() {
    let server = SseServer::start(vec![
        sse_response(
            "Opening Chrome.",
            &[
                json!({"action": "key", "key": "cmd+space"}),
                json!({"action": "type", "text": "Chrome"}),
                json!({"action": "key", "key": "Return"}),
            ],
            "tool_use",
        ),
        sse_text("DONE: Opening Chrome"),
    ]);
    let mut rig = build(&server, vec!["Open Chrome"]);

    rig.manager.run().await.unwrap();

    assert_eq!(rig.sink.recorded().len(), 3);
    let spoken = rig.tts.spoken();
    // A filler phrase played while the model worked.
    assert!(
        spoken.iter().any(|s| ["On it.", "Sure.", "Let me do that.", "Got it.", "One moment."]
            .contains(&s.as_str())),
        "no filler in {spoken:?}"
    );
    assert!(spoken.iter().any(|s| s.contains("Opening Chrome")));
}

#[tokio::test]
async fn remember_routes_to_memory_store() {
    let server = SseServer::start(vec![sse_text(
        &json!({
            "type": "memory",
            "remember": "Prefers aisle seats",
            "response": "Got it.",
        })
        .to_string(),
    )]);
    let mut rig = build(&server, vec!["Remember I like aisle seats"]);

    rig.manager.run().await.unwrap();

    assert_eq!(rig.memory.facts(), vec!["Prefers aisle seats"]);
    assert!(rig.tts.spoken().iter().any(|s| s == "Got it."));
    // No actions for a memory utterance.
    assert!(rig.sink.recorded().is_empty());
}

#[tokio::test]
async fn followup_interpretation_runs_rewritten_directive() {
    let server = SseServer::start(vec![
        sse_text(
            &json!({
                "type": "followup",
                "directive": "Open Firefox instead of Chrome",
                "response": "Switching to Firefox",
            })
            .to_string(),
        ),
        sse_response(
            "Opening Firefox.",
            &[json!({"action": "type", "text": "Firefox"})],
            "tool_use",
        ),
        sse_text("DONE: Opened Firefox"),
    ]);
    let mut rig = build(&server, vec!["Actually, make it Firefox"]);

    rig.manager.run().await.unwrap();

    assert!(rig.tts.spoken().iter().any(|s| s == "Switching to Firefox"));
    assert_eq!(
        rig.sink.recorded(),
        vec![cua::action::ScreenAction::Type { text: "Firefox".into() }]
    );
    // The rewritten directive, not the raw utterance, reached the model.
    assert!(server.request(1).contains("Open Firefox instead of Chrome"));
}

#[tokio::test]
async fn quit_token_ends_the_session() {
    let server = SseServer::start(vec![]);
    let mut rig = build(&server, vec!["quit", "Open Chrome"]);

    // "quit" is first in the script; nothing after it runs.
    rig.manager.run().await.unwrap();
    assert!(rig.sink.recorded().is_empty());
    assert!(rig.tts.spoken().iter().any(|s| s == "Goodbye."));
    assert_eq!(server.request_count(), 0);
}
