//! Shared fakes and a canned-response inference server.

use cua::action::{ActionSink, ScreenAction};
use cua::error::{AgentError, Result};
use cua::narration::TtsBackend;
use cua::screen::{Screenshot, ScreenSource};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

// ── inference server ─────────────────────────────────────────────────

/// Serves a scripted sequence of SSE bodies, one per request, recording
/// each request body. Requests beyond the script get HTTP 500.
pub struct SseServer {
    pub url: String,
    pub requests: Arc<Mutex<Vec<String>>>,
}

impl SseServer {
    pub fn start(responses: Vec<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        std::thread::spawn(move || {
            let mut remaining = responses.into_iter();
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let body = read_request_body(&mut stream);
                seen.lock().unwrap().push(body);
                match remaining.next() {
                    Some(sse) => {
                        let head = format!(
                            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\
                             content-length: {}\r\nconnection: close\r\n\r\n",
                            sse.len()
                        );
                        let _ = stream.write_all(head.as_bytes());
                        let _ = stream.write_all(sse.as_bytes());
                    }
                    None => {
                        let _ = stream.write_all(
                            b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\n\
                              connection: close\r\n\r\n",
                        );
                    }
                }
            }
        });

        Self {
            url: format!("http://{addr}"),
            requests,
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request(&self, index: usize) -> String {
        self.requests.lock().unwrap()[index].clone()
    }
}

fn read_request_body(stream: &mut std::net::TcpStream) -> String {
    let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            return String::new();
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some(value) = line.to_lowercase().strip_prefix("content-length:") {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }
    let mut body = vec![0u8; content_length];
    if reader.read_exact(&mut body).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&body).into_owned()
}

// ── SSE body builders ────────────────────────────────────────────────

fn event(name: &str, data: &str) -> String {
    format!("event: {name}\ndata: {data}\n\n")
}

/// A full streamed response: optional text, then tool calls, then the
/// stop reason.
pub fn sse_response(text: &str, tool_inputs: &[serde_json::Value], stop_reason: &str) -> String {
    let mut body = String::new();
    body.push_str(&event("message_start", r#"{"type":"message_start"}"#));
    let mut index = 0usize;
    if !text.is_empty() {
        body.push_str(&event(
            "content_block_start",
            &format!(r#"{{"index":{index},"content_block":{{"type":"text"}}}}"#),
        ));
        let delta = serde_json::json!({
            "index": index,
            "delta": { "type": "text_delta", "text": text },
        });
        body.push_str(&event("content_block_delta", &delta.to_string()));
        body.push_str(&event("content_block_stop", &format!(r#"{{"index":{index}}}"#)));
        index += 1;
    }
    for input in tool_inputs {
        let start = serde_json::json!({
            "index": index,
            "content_block": { "type": "tool_use", "id": format!("tu_{index}"), "name": "computer" },
        });
        body.push_str(&event("content_block_start", &start.to_string()));
        let delta = serde_json::json!({
            "index": index,
            "delta": { "type": "input_json_delta", "partial_json": input.to_string() },
        });
        body.push_str(&event("content_block_delta", &delta.to_string()));
        body.push_str(&event("content_block_stop", &format!(r#"{{"index":{index}}}"#)));
        index += 1;
    }
    body.push_str(&event(
        "message_delta",
        &format!(r#"{{"delta":{{"stop_reason":"{stop_reason}"}}}}"#),
    ));
    body.push_str(&event("message_stop", r#"{"type":"message_stop"}"#));
    body
}

/// A text-only response (planner JSON or a DONE/CLARIFY signal).
pub fn sse_text(text: &str) -> String {
    sse_response(text, &[], "end_turn")
}

// ── collaborator fakes ───────────────────────────────────────────────

pub struct FakeScreen {
    pub captures: AtomicU32,
    pub fail: AtomicBool,
}

impl FakeScreen {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            captures: AtomicU32::new(0),
            fail: AtomicBool::new(false),
        })
    }
}

impl ScreenSource for FakeScreen {
    fn capture(&self) -> Result<Screenshot> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AgentError::Screen("capture revoked".into()));
        }
        self.captures.fetch_add(1, Ordering::SeqCst);
        Ok(Screenshot {
            png: b"\x89PNG-test".to_vec(),
            logical_w: 2048,
            logical_h: 1280,
            bitmap_w: 1024,
            bitmap_h: 640,
            captured_at: Instant::now(),
        })
    }
}

#[derive(Default)]
pub struct FakeSink {
    pub actions: Mutex<Vec<ScreenAction>>,
    pub maximize_calls: AtomicU32,
}

impl FakeSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn recorded(&self) -> Vec<ScreenAction> {
        self.actions.lock().unwrap().clone()
    }
}

impl ActionSink for FakeSink {
    fn perform(&self, action: &ScreenAction) -> Result<()> {
        self.actions.lock().unwrap().push(action.clone());
        Ok(())
    }

    fn maximize_foreground_window(&self) -> Result<()> {
        self.maximize_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cursor_position(&self) -> Result<(i32, i32)> {
        Ok((0, 0))
    }
}

/// TTS that records text and completes immediately.
#[derive(Default)]
pub struct InstantTts {
    pub spoken: Mutex<Vec<String>>,
}

impl InstantTts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

impl TtsBackend for InstantTts {
    fn speak(&self, text: &str, on_done: Box<dyn FnOnce() + Send>) {
        self.spoken.lock().unwrap().push(text.to_owned());
        on_done();
    }
    fn stop(&self) {}
}

// ── config helpers ───────────────────────────────────────────────────

/// Config pointed at the test server with fast settle timings.
pub fn test_config(server_url: &str) -> cua::AgentConfig {
    let mut config = cua::AgentConfig::default();
    config.inference.api_url = server_url.to_owned();
    config.inference.api_key = "test-key".to_owned();
    config.executor.action_settle_ms = 1;
    config.executor.batch_settle_ms = 1;
    config.executor.guide_pause_ms = 5;
    config
}
