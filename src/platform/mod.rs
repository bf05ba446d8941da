//! Platform collaborator wiring.
//!
//! The orchestration core talks to the desktop through traits: screen
//! capture, input dispatch, TTS playback, the platform speech recognizers,
//! and the guidance overlay. A host build registers real implementations
//! here; platforms without an integration get a probe error so startup
//! can fail with a remedial message instead of a crash.

use crate::action::ActionSink;
use crate::error::{AgentError, Result};
use crate::narration::TtsBackend;
use crate::overlay::Overlay;
use crate::screen::ScreenSource;
use crate::stt::RecognizerStream;
use crate::stt::on_device::LocalSpeechEngine;
use std::sync::Arc;

mod stub;

/// Everything the core borrows from the host platform.
pub struct Collaborators {
    pub screen: Arc<dyn ScreenSource>,
    pub sink: Arc<dyn ActionSink>,
    pub tts: Arc<dyn TtsBackend>,
    pub recognizer: Arc<dyn RecognizerStream>,
    pub speech_engine: Arc<dyn LocalSpeechEngine>,
    pub overlay: Arc<dyn Overlay>,
}

/// Request microphone, speech, screen, and accessibility permissions.
///
/// Requested unconditionally at startup so a mid-session STT fallback
/// never triggers a permission prompt.
///
/// # Errors
///
/// Returns [`AgentError::Permission`] naming the denied setting.
pub fn request_permissions() -> Result<()> {
    stub::request_permissions()
}

/// Probe the host platform for collaborator implementations.
///
/// # Errors
///
/// Returns [`AgentError::Permission`] when this build carries no desktop
/// integration.
pub fn collaborators() -> Result<Collaborators> {
    stub::collaborators()
}

pub(crate) fn unsupported(what: &str) -> AgentError {
    AgentError::Permission(format!(
        "no {what} integration on this platform; embed the cua library and \
         supply Collaborators for your desktop environment"
    ))
}
