//! Container engine error types.

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while driving the container engine CLI.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine command exited non-zero or could not be spawned.
    #[error("engine {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Failed to parse engine output.
    #[error("failed to parse engine output: {0}")]
    ParseError(String),

    /// A command inside the container exceeded its deadline.
    #[error("exec timed out after {0} seconds")]
    ExecTimeout(u64),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub(crate) fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }
}
