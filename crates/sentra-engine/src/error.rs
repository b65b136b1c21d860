/// Errors raised by the scanning engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] sentra_core::CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to load rule set from {path}: {reason}")]
    RulesLoad { path: String, reason: String },

    #[error("Rule scan failed: {0}")]
    RuleScan(String),

    #[error("Realtime monitoring is already running")]
    AlreadyRunning,

    #[error("Failed to spawn {thread} thread: {reason}")]
    SpawnFailed { thread: &'static str, reason: String },

    #[error("Watch specification is empty after parsing: {0}")]
    EmptyWatchSpec(String),
}
