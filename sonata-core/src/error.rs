//! Error taxonomy shared by the engine, registry, player and scheduler layers.

use std::path::PathBuf;
use std::time::Duration;

/// Failures talking to, or supervising, the synthesis engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to launch engine {path:?}: {source}")]
    Launch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("engine i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed engine message: {0}")]
    Protocol(String),

    #[error("engine returned an error: {0}")]
    Remote(String),

    #[error("unexpected reply to {call}: {reply}")]
    UnexpectedReply { call: &'static str, reply: String },

    #[error("engine connection closed")]
    Disconnected,

    #[error("engine unreachable: {0}")]
    Unreachable(String),

    #[error("engine did not answer within {0:?}")]
    Timeout(Duration),
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Protocol(e.to_string())
    }
}

/// Voice lookup and voice directory problems.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("invalid voice directory name: {0}")]
    InvalidName(String),

    #[error("voice {key} is missing its {missing} file")]
    MissingFiles { key: String, missing: &'static str },

    #[error("a voice with the given key `{0}` was not found")]
    NotFound(String),

    #[error("no voice found for language `{0}`")]
    LanguageNotFound(String),

    #[error("speaker `{0}` was not found")]
    SpeakerNotFound(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Audio output failures.
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error("audio device error: {0}")]
    Device(String),

    #[error("player pool is closed")]
    Closed,
}

/// Why a single task stopped before completing.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task cancelled")]
    Cancelled,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Player(#[from] PlayerError),

    #[error("worker pool: {0}")]
    Worker(String),
}

/// Errors surfaced by the driver facade.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("driver unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Voice(#[from] VoiceError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Player(#[from] PlayerError),
}
