//! Cloud recognizer backend.
//!
//! Streams partials from the platform recognizer, fires the
//! stable-partial callback after the transcript holds still, and ends
//! listening after a silence gap or the no-speech deadline.

use super::{RecognizerEvent, RecognizerStream, SttProvider, StablePartialFn, non_empty};
use crate::config::SttConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info};

/// Timer granularity for the silence and stability checks.
const TICK: Duration = Duration::from_millis(50);

pub struct CloudStt {
    recognizer: Arc<dyn RecognizerStream>,
    config: SttConfig,
}

impl CloudStt {
    #[must_use]
    pub fn new(recognizer: Arc<dyn RecognizerStream>, config: SttConfig) -> Self {
        Self { recognizer, config }
    }
}

#[async_trait]
impl SttProvider for CloudStt {
    async fn setup(&mut self) -> bool {
        // The cloud session is created per-listen; nothing to warm up.
        true
    }

    async fn listen(&mut self, mut on_stable_partial: StablePartialFn) -> Result<Option<String>> {
        let mut rx = self.recognizer.start().await?;
        let started = Instant::now();
        let silence = Duration::from_millis(self.config.cloud_silence_ms);
        let stability = Duration::from_millis(self.config.stable_partial_ms);
        let no_speech = Duration::from_secs(self.config.no_speech_timeout_s);

        let mut partial = String::new();
        let mut last_change: Option<Instant> = None;
        let mut stable_fired = false;

        loop {
            if partial.is_empty() && started.elapsed() >= no_speech {
                info!("no speech within {}s, giving up", self.config.no_speech_timeout_s);
                self.recognizer.stop();
                return Ok(None);
            }
            if let Some(changed) = last_change {
                if changed.elapsed() >= silence {
                    break;
                }
                if !stable_fired && changed.elapsed() >= stability {
                    debug!("stable partial: \"{partial}\"");
                    on_stable_partial(&partial);
                    stable_fired = true;
                }
            }

            tokio::select! {
                event = rx.recv() => match event {
                    Some(RecognizerEvent::Partial(p)) => {
                        if p != partial {
                            partial = p;
                            last_change = Some(Instant::now());
                            stable_fired = false;
                        }
                    }
                    Some(RecognizerEvent::Energy(_)) => {}
                    Some(RecognizerEvent::Ended) | None => break,
                },
                () = sleep(TICK) => {}
            }
        }

        self.recognizer.stop();
        Ok(non_empty(partial))
    }

    fn stop_listening(&self) {
        self.recognizer.stop();
    }
}
