//! Error types for the cua agent.

/// Top-level error type for the voice-to-action pipeline.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Microphone, speech, screen, or accessibility permission denied.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Transient network failure (non-200, connection reset, stream cut).
    #[error("network error: {0}")]
    Network(String),

    /// Malformed JSON or protocol text from a model.
    #[error("parse error: {0}")]
    Parse(String),

    /// Screen capture failed or was revoked mid-session.
    #[error("screen capture error: {0}")]
    Screen(String),

    /// Input event dispatch error.
    #[error("action error: {0}")]
    Action(String),

    /// Speech-to-text error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Memory storage error.
    #[error("memory error: {0}")]
    Memory(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// The current task was cancelled by the user.
    #[error("cancelled")]
    Cancelled,
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AgentError>;
