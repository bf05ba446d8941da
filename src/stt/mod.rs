//! Speech-to-text providers.
//!
//! Two interchangeable backends implement the same three-method surface:
//! one-shot `setup`, `listen` with a stable-partial callback, and
//! `stop_listening`. The platform recognizer APIs themselves sit behind
//! small session traits so the timing logic here stays testable.

pub mod cloud;
pub mod on_device;

use crate::config::SttConfig;
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

pub use cloud::CloudStt;
pub use on_device::OnDeviceStt;

/// Fired when the partial transcript has stabilized; the voice loop uses
/// it to pre-capture the screen and fire the speculative call.
pub type StablePartialFn = Box<dyn FnMut(&str) + Send>;

/// Events emitted by a platform recognizer session.
#[derive(Debug, Clone)]
pub enum RecognizerEvent {
    /// Updated cumulative partial transcript.
    Partial(String),
    /// Measured buffer energy for one audio frame (on-device engines).
    Energy(f32),
    /// The platform session ended on its own.
    Ended,
}

/// A live platform recognizer session feeding [`RecognizerEvent`]s.
#[async_trait]
pub trait RecognizerStream: Send + Sync {
    /// Open the microphone and start streaming events.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AgentError::Permission`] when microphone or speech
    /// access is denied, [`crate::AgentError::Stt`] otherwise.
    async fn start(&self) -> Result<mpsc::Receiver<RecognizerEvent>>;

    /// Tear down the session.
    fn stop(&self);
}

/// Three-method capability both STT backends implement.
#[async_trait]
pub trait SttProvider: Send + Sync {
    /// One-shot initialization. `false` means the backend is unusable.
    async fn setup(&mut self) -> bool;

    /// Listen for one utterance. Returns the final transcript, or `None`
    /// when no speech arrived before the deadline.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform session cannot start.
    async fn listen(&mut self, on_stable_partial: StablePartialFn) -> Result<Option<String>>;

    /// Abort the in-progress listen.
    fn stop_listening(&self);
}

/// Pick the configured backend, falling back to the cloud recognizer when
/// on-device setup fails.
pub async fn select_provider(
    config: &SttConfig,
    mut on_device: Box<dyn SttProvider>,
    mut cloud: Box<dyn SttProvider>,
) -> Box<dyn SttProvider> {
    if config.prefer_on_device {
        if on_device.setup().await {
            return on_device;
        }
        warn!("on-device STT setup failed, falling back to cloud recognizer");
    }
    if !cloud.setup().await {
        warn!("cloud recognizer setup reported not ready");
    }
    cloud
}

fn non_empty(text: String) -> Option<String> {
    if text.trim().is_empty() { None } else { Some(text) }
}
