//! cua: a voice-first computer-use agent.
//!
//! Speak a request; the agent plans, narrates, and executes mouse and
//! keyboard actions to complete it.
//!
//! # Architecture
//!
//! A single-operator interactive loop built from shared, internally
//! synchronized components:
//! - **Voice loop**: owns one utterance at a time, from microphone open
//!   to spoken result
//! - **Speculative dispatcher**: fires the model call early on a stable
//!   partial transcript, hiding STT finalization latency
//! - **Two-model pipeline**: a fast tool-calling executor for most
//!   requests, a JSON-only planner for the hard ones
//! - **Narration queue**: serialized TTS with mute/interrupt/preempt
//!   semantics, coordinated with microphone lifetime
//! - **Clarification bridge**: suspends a task while a question is asked
//!   and answered over the same microphone
//!
//! Desktop capture/input, the platform speech APIs, TTS playback, and the
//! overlay widget are host-supplied collaborators behind traits.

pub mod action;
pub mod clarify;
pub mod config;
pub mod context;
pub mod cua_dirs;
pub mod error;
pub mod executor;
pub mod inference;
pub mod memory;
pub mod narration;
pub mod overlay;
pub mod perf;
pub mod planner;
pub mod platform;
pub mod repl;
pub mod screen;
pub mod session_log;
pub mod speculative;
pub mod stt;
pub mod voice;

pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use executor::{DirectOutcome, Executor};
pub use narration::NarrationQueue;
pub use planner::{Planner, PlannerPipeline};
pub use speculative::SpeculativeDispatcher;
pub use voice::VoiceManager;
