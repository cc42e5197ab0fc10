//! Engine error types.

/// A script evaluation failure. The message carries the exception text
/// and stack as rendered by the runtime.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ScriptError {
    pub message: String,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UnitCreationError {
    #[error("failed to spawn unit thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("unit startup failed: {0}")]
    Startup(String),
    #[error("unit startup timed out")]
    StartupTimeout,
}
