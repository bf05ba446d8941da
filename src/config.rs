//! Configuration types for the voice-to-action pipeline.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Bundled demo credentials used when `INFERENCE_API_KEY` is unset.
///
/// Rate-limited server-side; real deployments set their own key.
const DEMO_API_KEY: &str = "cua-demo-0b7df41c";

/// Top-level configuration for the agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Remote inference settings.
    pub inference: InferenceConfig,
    /// Speech-to-text settings.
    pub stt: SttConfig,
    /// Speculative dispatch settings.
    pub speculation: SpeculationConfig,
    /// Direct-execution loop settings.
    pub executor: ExecutorConfig,
    /// Planner pipeline settings.
    pub planner: PlannerConfig,
}

/// Remote inference configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Base URL of the chat-completion endpoint.
    pub api_url: String,
    /// API key; empty means "use the bundled demo key".
    pub api_key: String,
    /// Fast tool-calling executor model.
    pub executor_model: String,
    /// JSON-only planner model.
    pub planner_model: String,
    /// Maximum tokens per completion.
    pub max_tokens: u32,
    /// Widest bitmap the model is told it sees; captures are downscaled to fit.
    pub max_model_width: u32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.anthropic.com/v1/messages".to_owned(),
            api_key: String::new(),
            executor_model: "claude-sonnet-4-5".to_owned(),
            planner_model: "claude-opus-4-1".to_owned(),
            max_tokens: 2048,
            max_model_width: 1024,
        }
    }
}

impl InferenceConfig {
    /// Effective API key: configured key, or the bundled demo key.
    #[must_use]
    pub fn effective_api_key(&self) -> String {
        if self.api_key.trim().is_empty() {
            warn!("INFERENCE_API_KEY not set, using bundled demo key");
            DEMO_API_KEY.to_owned()
        } else {
            self.api_key.clone()
        }
    }
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Prefer the on-device recognizer; fall back to cloud on setup failure.
    pub prefer_on_device: bool,
    /// How long a partial transcript must stay unchanged before the
    /// stable-partial callback fires.
    pub stable_partial_ms: u64,
    /// Cloud recognizer: silence gap that ends listening.
    pub cloud_silence_ms: u64,
    /// On-device recognizer: sustained low-energy window that ends listening.
    pub on_device_silence_ms: u64,
    /// On-device recognizer: buffer energy below this counts as silence.
    pub energy_floor: f32,
    /// Give up listening entirely after this many seconds without speech.
    pub no_speech_timeout_s: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            prefer_on_device: false,
            stable_partial_ms: 500,
            cloud_silence_ms: 1200,
            on_device_silence_ms: 350,
            energy_floor: 0.02,
            no_speech_timeout_s: 60,
        }
    }
}

/// Speculative dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeculationConfig {
    /// Master switch; even when enabled the dispatcher may auto-disable.
    pub enabled: bool,
    /// Minimum gap between fires.
    pub cooldown_ms: u64,
    /// A response that returned faster than this cannot have meaningfully
    /// processed the audio and is never claimed.
    pub min_processing_ms: u64,
    /// How long a claim will wait for an in-flight call.
    pub claim_wait_ms: u64,
    /// Auto-disable: utterances observed before the hit-rate check applies.
    pub min_utterances: u32,
    /// Auto-disable: hit-rate threshold.
    pub min_hit_rate: f32,
    /// Auto-disable: consecutive misses with zero hits.
    pub max_consecutive_misses: u32,
}

impl Default for SpeculationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cooldown_ms: 500,
            min_processing_ms: 200,
            claim_wait_ms: 3000,
            min_utterances: 10,
            min_hit_rate: 0.30,
            max_consecutive_misses: 5,
        }
    }
}

/// Direct-execution loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Rounds the fast path may run before escalating to the planner.
    pub max_direct_iterations: usize,
    /// Rounds per planner work block.
    pub max_iterations_per_block: usize,
    /// Images kept in history after trimming.
    pub max_screenshots: usize,
    /// Sleep after each dispatched action.
    pub action_settle_ms: u64,
    /// Sleep after a full action batch, before the fresh screenshot.
    pub batch_settle_ms: u64,
    /// Pause after showing a GUIDE highlight, before recapturing.
    pub guide_pause_ms: u64,
    /// Maximize the focused window after the first successful batch.
    pub maximize_on_first_batch: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_direct_iterations: 8,
            max_iterations_per_block: 10,
            max_screenshots: 3,
            action_settle_ms: 200,
            batch_settle_ms: 300,
            guide_pause_ms: 1500,
            maximize_on_first_batch: true,
        }
    }
}

/// Planner pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Replans per turn before returning the partial accomplishment.
    pub max_replans: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self { max_replans: 2 }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let body = std::fs::read_to_string(path)?;
        toml::from_str(&body).map_err(|e| AgentError::Config(format!("invalid config file: {e}")))
    }

    /// Load the default config file if present, otherwise defaults.
    ///
    /// # Errors
    ///
    /// Returns an error only if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let path = crate::cua_dirs::config_path();
        if path.exists() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply environment variable overrides on top of file/default values.
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("INFERENCE_API_KEY") {
            if !key.trim().is_empty() {
                self.inference.api_key = key;
            }
        }
        if env_flag("USE_SPECULATIVE") {
            self.speculation.enabled = true;
        }
        if env_flag("USE_ON_DEVICE_STT") {
            self.stt.prefer_on_device = true;
        }
        if env_flag("CUA_NO_MAXIMIZE") {
            self.executor.maximize_on_first_batch = false;
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v.trim() == "1").unwrap_or(false)
}

/// Parse a `.env` file in the working directory into the process
/// environment. Existing variables are never overridden.
///
/// Lines are `KEY=VALUE`; `#` starts a comment; blank lines are skipped.
pub fn load_dotenv() {
    let Ok(body) = std::fs::read_to_string(".env") else {
        return;
    };
    for raw in body.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('"');
        if key.is_empty() || std::env::var_os(key).is_some() {
            continue;
        }
        std::env::set_var(key, value);
    }
}
