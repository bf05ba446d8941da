//! On-device recognizer backend.
//!
//! Loads a small English speech model on first use and streams with a
//! built-in VAD: end-of-speech is declared when measured buffer energy
//! stays below the floor long enough. The engine's internal
//! "waiting for speech" placeholder is filtered out of partials.

use super::{RecognizerEvent, SttProvider, StablePartialFn, non_empty};
use crate::config::SttConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Timer granularity for the energy-floor check.
const TICK: Duration = Duration::from_millis(50);

/// Placeholder partial emitted by the engine before speech starts.
const ENGINE_PLACEHOLDER: &str = "waiting for speech";

/// Local speech engine behind the on-device backend.
#[async_trait]
pub trait LocalSpeechEngine: Send + Sync {
    /// Load the model. Idempotent; called lazily on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be loaded.
    async fn load(&self) -> Result<()>;

    /// Open the microphone and stream partials plus frame energies.
    ///
    /// # Errors
    ///
    /// Returns an error if the audio session cannot start.
    async fn start(&self) -> Result<mpsc::Receiver<RecognizerEvent>>;

    /// Tear down the session.
    fn stop(&self);
}

pub struct OnDeviceStt {
    engine: Arc<dyn LocalSpeechEngine>,
    config: SttConfig,
    loaded: bool,
}

impl OnDeviceStt {
    #[must_use]
    pub fn new(engine: Arc<dyn LocalSpeechEngine>, config: SttConfig) -> Self {
        Self { engine, config, loaded: false }
    }
}

#[async_trait]
impl SttProvider for OnDeviceStt {
    async fn setup(&mut self) -> bool {
        if self.loaded {
            return true;
        }
        match self.engine.load().await {
            Ok(()) => {
                info!("on-device speech model loaded");
                self.loaded = true;
                true
            }
            Err(e) => {
                warn!("on-device speech model failed to load: {e}");
                false
            }
        }
    }

    async fn listen(&mut self, mut on_stable_partial: StablePartialFn) -> Result<Option<String>> {
        if !self.loaded {
            self.engine.load().await?;
            self.loaded = true;
        }
        let mut rx = self.engine.start().await?;
        let started = Instant::now();
        let silence = Duration::from_millis(self.config.on_device_silence_ms);
        let stability = Duration::from_millis(self.config.stable_partial_ms);
        let no_speech = Duration::from_secs(self.config.no_speech_timeout_s);

        let mut partial = String::new();
        let mut last_change: Option<Instant> = None;
        let mut stable_fired = false;
        let mut quiet_since: Option<Instant> = None;

        loop {
            if partial.is_empty() && started.elapsed() >= no_speech {
                info!("no speech within {}s, giving up", self.config.no_speech_timeout_s);
                self.engine.stop();
                return Ok(None);
            }
            // VAD end-of-speech: sustained low energy after real speech.
            if !partial.is_empty() {
                if let Some(quiet) = quiet_since {
                    if quiet.elapsed() >= silence {
                        break;
                    }
                }
            }
            if let Some(changed) = last_change {
                if !stable_fired && changed.elapsed() >= stability {
                    debug!("stable partial: \"{partial}\"");
                    on_stable_partial(&partial);
                    stable_fired = true;
                }
            }

            tokio::select! {
                event = rx.recv() => match event {
                    Some(RecognizerEvent::Partial(p)) => {
                        if is_placeholder(&p) {
                            continue;
                        }
                        if p != partial {
                            partial = p;
                            last_change = Some(Instant::now());
                            stable_fired = false;
                        }
                    }
                    Some(RecognizerEvent::Energy(e)) => {
                        if e < self.config.energy_floor {
                            quiet_since.get_or_insert_with(Instant::now);
                        } else {
                            quiet_since = None;
                        }
                    }
                    Some(RecognizerEvent::Ended) | None => break,
                },
                () = sleep(TICK) => {}
            }
        }

        self.engine.stop();
        Ok(non_empty(partial))
    }

    fn stop_listening(&self) {
        self.engine.stop();
    }
}

fn is_placeholder(partial: &str) -> bool {
    partial.trim().to_lowercase().starts_with(ENGINE_PLACEHOLDER)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedEngine {
        script: Mutex<Vec<(u64, RecognizerEvent)>>,
        loads: AtomicU32,
        fail_load: bool,
    }

    impl ScriptedEngine {
        fn new(script: Vec<(u64, RecognizerEvent)>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                loads: AtomicU32::new(0),
                fail_load: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(Vec::new()),
                loads: AtomicU32::new(0),
                fail_load: true,
            })
        }
    }

    #[async_trait]
    impl LocalSpeechEngine for ScriptedEngine {
        async fn load(&self) -> Result<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail_load {
                return Err(crate::error::AgentError::Stt("model missing".into()));
            }
            Ok(())
        }

        async fn start(&self) -> Result<mpsc::Receiver<RecognizerEvent>> {
            let script: Vec<_> = self.script.lock().unwrap().drain(..).collect();
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                for (delay_ms, event) in script {
                    sleep(Duration::from_millis(delay_ms)).await;
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }

        fn stop(&self) {}
    }

    fn fast_config() -> SttConfig {
        SttConfig {
            on_device_silence_ms: 100,
            stable_partial_ms: 60,
            no_speech_timeout_s: 1,
            ..SttConfig::default()
        }
    }

    #[tokio::test]
    async fn energy_floor_ends_listening() {
        let engine = ScriptedEngine::new(vec![
            (10, RecognizerEvent::Partial("open chrome".into())),
            (20, RecognizerEvent::Energy(0.4)),
            (30, RecognizerEvent::Energy(0.005)),
        ]);
        let mut stt = OnDeviceStt::new(engine, fast_config());
        let result = stt.listen(Box::new(|_| {})).await.unwrap();
        assert_eq!(result.as_deref(), Some("open chrome"));
    }

    #[tokio::test]
    async fn loud_frames_reset_the_quiet_window() {
        let engine = ScriptedEngine::new(vec![
            (10, RecognizerEvent::Partial("find".into())),
            (20, RecognizerEvent::Energy(0.001)),
            (60, RecognizerEvent::Energy(0.5)),
            (70, RecognizerEvent::Partial("find flights".into())),
            (80, RecognizerEvent::Energy(0.001)),
        ]);
        let mut stt = OnDeviceStt::new(engine, fast_config());
        let result = stt.listen(Box::new(|_| {})).await.unwrap();
        assert_eq!(result.as_deref(), Some("find flights"));
    }

    #[tokio::test]
    async fn placeholder_partials_filtered() {
        let engine = ScriptedEngine::new(vec![
            (10, RecognizerEvent::Partial("Waiting for speech...".into())),
            (20, RecognizerEvent::Partial("close tab".into())),
            (30, RecognizerEvent::Energy(0.001)),
        ]);
        let mut stt = OnDeviceStt::new(engine, fast_config());
        let result = stt.listen(Box::new(|_| {})).await.unwrap();
        assert_eq!(result.as_deref(), Some("close tab"));
    }

    #[tokio::test]
    async fn setup_loads_model_once() {
        let engine = ScriptedEngine::new(vec![]);
        let mut stt = OnDeviceStt::new(Arc::clone(&engine) as Arc<dyn LocalSpeechEngine>, fast_config());
        assert!(stt.setup().await);
        assert!(stt.setup().await);
        assert_eq!(engine.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_setup_reports_not_ready() {
        let engine = ScriptedEngine::failing();
        let mut stt = OnDeviceStt::new(engine, fast_config());
        assert!(!stt.setup().await);
    }
}
